use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Name of the trailing control field carried by every record.
pub const CONTROL_FIELD_NAME: &str = ".";

/// Upper bound on a single decoded field, guards against reading garbage lengths.
const MAX_DECODED_FIELD_BYTES: u32 = 64 * 1024 * 1024;

/// Sink for complete records.
///
/// The process input implements this through [`LengthEncodedWriter`]; tests
/// substitute capturing implementations.
#[async_trait]
pub trait RecordWriter: Send {
    async fn write_record(&mut self, record: &[String]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;
}

/// Writes records in the length-encoded framing understood by the analytics process.
///
/// A record is a 4-byte big-endian field count followed by, for every field, a
/// 4-byte big-endian byte length and the UTF-8 bytes of the value. Values are
/// neither terminated nor escaped.
///
/// The writer never closes the underlying sink: closing the process input means
/// end-of-data to the child and is left to the supervisor.
#[derive(Debug)]
pub struct LengthEncodedWriter<W> {
    inner: W,
}

impl<W> LengthEncodedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write the field count that starts a record.
    pub async fn write_num_fields(&mut self, num_fields: usize) -> io::Result<()> {
        let num_fields = frame_len(num_fields)?;
        self.inner.write_u32(num_fields).await
    }

    /// Write a single length-prefixed field.
    pub async fn write_field(&mut self, value: &str) -> io::Result<()> {
        let bytes = value.as_bytes();
        self.inner.write_u32(frame_len(bytes.len())?).await?;
        self.inner.write_all(bytes).await
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> RecordWriter for LengthEncodedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_record(&mut self, record: &[String]) -> io::Result<()> {
        self.write_num_fields(record.len()).await?;
        for field in record {
            self.write_field(field).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

fn frame_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("length {len} does not fit in a 4-byte frame"),
        )
    })
}

/// Read one length-encoded record.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new record starts.
pub async fn read_record<R>(reader: &mut R) -> io::Result<Option<Vec<String>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let num_fields = match reader.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut record = Vec::with_capacity(num_fields.min(1024) as usize);
    for _ in 0..num_fields {
        let len = reader.read_u32().await?;
        if len > MAX_DECODED_FIELD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("field length {len} exceeds limit"),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        let value = String::from_utf8(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        record.push(value);
    }
    Ok(Some(record))
}

/// Decode every record in `bytes`.
pub async fn read_all_records(mut bytes: &[u8]) -> io::Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    while let Some(record) = read_record(&mut bytes).await? {
        records.push(record);
    }
    Ok(records)
}
