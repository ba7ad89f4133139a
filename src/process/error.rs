use crate::ingest::WriteError;
use crate::wire::FlushId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no configuration for job '{0}'")]
    UnknownJob(String),

    /// Another call holds the job. Callers are expected to retry.
    #[error("job '{job_id}' is in use, cannot {action}")]
    JobInUse { job_id: String, action: String },

    #[error("no analytics process is running for job '{0}'")]
    NotRunning(String),

    #[error("analytics process for job '{job_id}' failed: {message}")]
    NativeProcess { job_id: String, message: String },

    #[error("field '{field}' is missing from the input header {header:?}")]
    MissingField { field: String, header: Vec<String> },

    #[error("malformed input after {errors} parse errors: {message}")]
    MalformedInput { errors: usize, message: String },

    #[error("upload failed: {0}")]
    Upload(#[source] WriteError),

    #[error("failed to launch the analytics process for job '{job_id}': {source}")]
    Launch {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("flush {flush_id} for job '{job_id}' was not acknowledged in time")]
    FlushTimeout { job_id: String, flush_id: FlushId },

    #[error("invalid job configuration: {0}")]
    Config(String),
}

impl ProcessError {
    pub fn in_use(job_id: &str, action: &str) -> Self {
        Self::JobInUse {
            job_id: job_id.to_string(),
            action: action.to_string(),
        }
    }

    pub fn native(job_id: &str, message: impl Into<String>) -> Self {
        Self::NativeProcess {
            job_id: job_id.to_string(),
            message: message.into(),
        }
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::JobInUse { .. })
    }
}

impl From<WriteError> for ProcessError {
    /// Lifts the data errors callers act on; everything else is an upload failure.
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::MissingField { field, header } => Self::MissingField { field, header },
            WriteError::MalformedInput { errors, message } => {
                Self::MalformedInput { errors, message }
            }
            WriteError::Transform(e) => Self::Config(e.to_string()),
            WriteError::Timestamp(e) => Self::Config(e.to_string()),
            other => Self::Upload(other),
        }
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;
