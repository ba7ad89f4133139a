pub mod args;
pub mod config;
pub mod ingest;

use crate::config::{load_config, Config, ConfigError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(
        "config not found\n\
         Searched locations:\n  ~/.config/procfeed/config.yml\n  /etc/procfeed/config.yml\n\n\
         Use --config <path> to specify a config file, \
         or run 'procfeed config init' to generate one."
    )]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("job '{0}' is not defined in the config")]
    UnknownJob(String),

    #[error("{0}")]
    Process(#[from] crate::process::ProcessError),

    #[error("cannot read '{path}': {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job '{job_id}' failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("interrupted")]
    Interrupted,
}

/// Load the resolved config file, failing with the searched locations when there is none.
pub fn load(config_path: Option<&Path>) -> Result<Config, CliError> {
    let path = config_path.ok_or(CliError::ConfigNotFound)?;
    info!(config_path = %path.display(), "loading configuration");
    Ok(load_config(path)?)
}
