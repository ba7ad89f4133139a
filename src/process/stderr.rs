use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Only the most recent lines are kept for error reports.
pub const MAX_STDERR_LINES: usize = 200;

/// Collects a child's stderr in the background.
pub struct StderrBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: JoinHandle<()>,
}

impl StderrBuffer {
    pub fn spawn(job_id: &str, stderr: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::new()));
        let buffer = Arc::clone(&lines);
        let job_id = job_id.to_string();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line).trim_end().to_string();
                        debug!(job_id = %job_id, "analytics: {}", text);
                        let mut lines = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                        if lines.len() == MAX_STDERR_LINES {
                            lines.pop_front();
                        }
                        lines.push_back(text);
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "failed reading analytics stderr");
                        break;
                    }
                }
            }
        });

        Self { lines, task }
    }

    /// Everything captured so far, one line per entry.
    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Give the reader up to `wait` to reach end of stream, then return the contents.
    pub async fn drain(mut self, wait: Duration) -> String {
        if tokio::time::timeout(wait, &mut self.task).await.is_err() {
            self.task.abort();
        }
        self.contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_collects_lines_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let buffer = StderrBuffer::spawn("job", Box::new(reader));

        writer.write_all(b"first\r\nsecond\nthird").await.unwrap();
        drop(writer);

        assert_eq!(buffer.drain(Duration::from_secs(5)).await, "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn test_keeps_only_recent_lines() {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let buffer = StderrBuffer::spawn("job", Box::new(reader));

        for i in 0..MAX_STDERR_LINES + 5 {
            writer.write_all(format!("line {i}\n").as_bytes()).await.unwrap();
        }
        drop(writer);

        let contents = buffer.drain(Duration::from_secs(5)).await;
        assert_eq!(contents.lines().count(), MAX_STDERR_LINES);
        assert!(contents.starts_with("line 5\n"));
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_open_stream() {
        let (_writer, reader) = tokio::io::duplex(1024);
        let buffer = StderrBuffer::spawn("job", Box::new(reader));
        assert_eq!(buffer.drain(Duration::from_millis(20)).await, "");
    }
}
