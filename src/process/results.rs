//! Consumes the analytics output stream.

use crate::ingest::json::JsonDocumentReader;
use crate::wire::FlushId;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const FLUSH_ACK_FIELD: &str = "flush";

/// Receives every document the analytics process writes, except flush acknowledgements.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn accept(&self, job_id: &str, result: Map<String, Value>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResultSink;

#[async_trait]
impl ResultSink for LoggingResultSink {
    async fn accept(&self, job_id: &str, result: Map<String, Value>) {
        let kind = result.keys().next().cloned().unwrap_or_else(|| "empty".to_string());
        let document = serde_json::Value::Object(result);
        info!(job_id, kind = %kind, "analytics result: {}", document);
    }
}

#[derive(Debug, Default, Clone)]
struct AckState {
    /// Highest acknowledged id, 0 before the first. The process handles
    /// flushes in order, so this covers every earlier id too.
    highest: FlushId,
    finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushWait {
    Acknowledged,
    /// The output stream closed before the acknowledgement arrived.
    StreamEnded,
    TimedOut,
}

/// Flush ids seen on the output stream.
#[derive(Debug, Clone)]
pub struct FlushAcknowledgements {
    state: watch::Receiver<AckState>,
}

impl FlushAcknowledgements {
    pub fn is_acknowledged(&self, id: FlushId) -> bool {
        self.state.borrow().highest >= id
    }

    pub async fn wait_for(&self, id: FlushId, timeout: Duration) -> FlushWait {
        let mut state = self.state.clone();
        let waited = tokio::time::timeout(
            timeout,
            state.wait_for(|s| s.highest >= id || s.finished),
        )
        .await
        .map(|r| r.map(|s| s.highest >= id));

        match waited {
            Err(_) => FlushWait::TimedOut,
            Ok(Ok(true)) => FlushWait::Acknowledged,
            Ok(Ok(false)) | Ok(Err(_)) => FlushWait::StreamEnded,
        }
    }
}

fn flush_ack_id(document: &Map<String, Value>) -> Option<FlushId> {
    if document.len() != 1 {
        return None;
    }
    match document.get(FLUSH_ACK_FIELD)? {
        Value::String(id) => id.parse().ok(),
        Value::Number(id) => id.as_u64(),
        _ => None,
    }
}

/// Read the output stream until it closes. The task yields the number of
/// results passed to `sink`.
pub fn spawn_results_reader(
    job_id: &str,
    stdout: Box<dyn AsyncRead + Unpin + Send>,
    sink: Arc<dyn ResultSink>,
) -> (JoinHandle<usize>, FlushAcknowledgements) {
    let (tx, rx) = watch::channel(AckState::default());
    let job_id = job_id.to_string();

    let task = tokio::spawn(async move {
        let mut reader = JsonDocumentReader::new(BufReader::new(stdout), usize::MAX);
        let mut results = 0;
        loop {
            match reader.next_object().await {
                Ok(Some((document, _))) => {
                    if let Some(id) = flush_ack_id(&document) {
                        debug!(job_id = %job_id, flush_id = id, "flush acknowledged");
                        tx.send_modify(|state| state.highest = state.highest.max(id));
                        continue;
                    }
                    results += 1;
                    sink.accept(&job_id, document).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "stopped reading analytics output");
                    break;
                }
            }
        }
        tx.send_modify(|state| state.finished = true);
        let parse_errors = reader.errors();
        debug!(job_id = %job_id, results, parse_errors, "analytics output closed");
        results
    });

    (task, FlushAcknowledgements { state: rx })
}
