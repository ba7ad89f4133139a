//! Supervision of the analytics processes that data is streamed to.

pub mod error;
pub mod jobs;
pub mod launch;
pub mod native;
pub mod results;
pub mod stderr;
pub mod supervisor;

pub use error::{ProcessError, ProcessResult};
pub use jobs::{InMemoryJobProvider, JobProvider, JobState, JobStatus};
pub use launch::{build_autodetect_command, AutodetectCommand, AutodetectProcessFactory};
pub use native::{ChildControl, NativeProcess, ProcessFactory};
pub use results::{FlushAcknowledgements, LoggingResultSink, ResultSink};
pub use supervisor::{ProcessManager, ProcessManagerBuilder};
