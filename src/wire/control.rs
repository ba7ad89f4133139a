//! Out-of-band instructions multiplexed onto the record stream.
//!
//! A control record has the same number of fields as a data record. Every
//! slot is empty except the trailing control field, which carries a one
//! character code followed by a message-specific payload.

use super::length_encoded::RecordWriter;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

pub const FLUSH_CODE: char = 'f';
pub const INTERIM_CODE: char = 'i';
pub const RESET_BUCKETS_CODE: char = 'r';
pub const ADVANCE_TIME_CODE: char = 't';
pub const UPDATE_CODE: char = 'u';

/// Size of the space block written after a flush. It must exceed the read
/// buffer of the analytics process so the flush is not left sitting in a pipe.
pub const FLUSH_PADDING_LEN: usize = 8192;

/// Identifier correlating a flush request with its acknowledgement.
pub type FlushId = u64;

/// Process-wide monotonically increasing flush id source, shared by all jobs.
#[derive(Debug)]
pub struct FlushIdGenerator {
    next: AtomicU64,
}

impl FlushIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: FlushId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> FlushId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for FlushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional epoch-second range attached to interim and reset messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    fn append_to(&self, out: &mut String) {
        // Without a start the message is the bare code.
        if let Some(start) = self.start {
            out.push_str(&start.to_string());
            out.push(' ');
            if let Some(end) = self.end {
                out.push_str(&end.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Flush(FlushId),
    Interim(TimeRange),
    ResetBuckets(TimeRange),
    AdvanceTime(i64),
    UpdateConfig(String),
}

impl ControlMessage {
    pub fn code(&self) -> char {
        match self {
            ControlMessage::Flush(_) => FLUSH_CODE,
            ControlMessage::Interim(_) => INTERIM_CODE,
            ControlMessage::ResetBuckets(_) => RESET_BUCKETS_CODE,
            ControlMessage::AdvanceTime(_) => ADVANCE_TIME_CODE,
            ControlMessage::UpdateConfig(_) => UPDATE_CODE,
        }
    }

    /// Text placed in the control slot.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.code());
        match self {
            ControlMessage::Flush(id) => out.push_str(&id.to_string()),
            ControlMessage::Interim(range) | ControlMessage::ResetBuckets(range) => {
                range.append_to(&mut out)
            }
            ControlMessage::AdvanceTime(epoch) => out.push_str(&epoch.to_string()),
            ControlMessage::UpdateConfig(text) => out.push_str(text),
        }
        out
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Flush(id) => write!(f, "flush {id}"),
            ControlMessage::Interim(_) => write!(f, "calculate interim results"),
            ControlMessage::ResetBuckets(_) => write!(f, "reset buckets"),
            ControlMessage::AdvanceTime(epoch) => write!(f, "advance time to {epoch}"),
            ControlMessage::UpdateConfig(_) => write!(f, "update config"),
        }
    }
}

/// Writes control records onto a record stream shared with data records.
pub struct ControlMsgWriter<'a> {
    writer: &'a mut (dyn RecordWriter + 'a),
    num_fields: usize,
}

impl<'a> ControlMsgWriter<'a> {
    /// `num_analysis_fields` excludes the time and control slots.
    pub fn new(writer: &'a mut (dyn RecordWriter + 'a), num_analysis_fields: usize) -> Self {
        Self {
            writer,
            num_fields: num_analysis_fields + 2,
        }
    }

    /// Write a flush, force it through the pipe and return its id.
    pub async fn write_flush(&mut self, ids: &FlushIdGenerator) -> io::Result<FlushId> {
        let id = ids.next_id();
        self.write_message(&ControlMessage::Flush(id)).await?;
        let padding = " ".repeat(FLUSH_PADDING_LEN);
        self.write_control_field(padding).await?;
        self.writer.flush().await?;
        Ok(id)
    }

    pub async fn write_calc_interim(&mut self, range: TimeRange) -> io::Result<()> {
        self.write_message(&ControlMessage::Interim(range)).await
    }

    pub async fn write_reset_buckets(&mut self, range: TimeRange) -> io::Result<()> {
        self.write_message(&ControlMessage::ResetBuckets(range)).await
    }

    pub async fn write_advance_time(&mut self, epoch: i64) -> io::Result<()> {
        self.write_message(&ControlMessage::AdvanceTime(epoch)).await
    }

    pub async fn write_update_config(&mut self, config: &str) -> io::Result<()> {
        self.write_message(&ControlMessage::UpdateConfig(config.to_string()))
            .await
    }

    pub async fn write_message(&mut self, message: &ControlMessage) -> io::Result<()> {
        self.write_control_field(message.encode()).await
    }

    async fn write_control_field(&mut self, text: String) -> io::Result<()> {
        let mut record = vec![String::new(); self.num_fields];
        if let Some(last) = record.last_mut() {
            *last = text;
        }
        self.writer.write_record(&record).await
    }
}
