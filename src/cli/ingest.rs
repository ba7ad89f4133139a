use super::CliError;
use crate::config::Config;
use crate::ingest::DataCounts;
use crate::process::{
    AutodetectProcessFactory, InMemoryJobProvider, JobProvider, JobStatus, ProcessFactory,
    ProcessManager,
};
use crate::wire::{FlushId, TimeRange};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub job_id: String,
    /// Read in order; stdin when empty.
    pub files: Vec<PathBuf>,
    pub flush: bool,
    pub calc_interim: bool,
    pub reset_start: Option<i64>,
    pub reset_end: Option<i64>,
}

impl IngestOptions {
    fn reset(&self) -> Option<TimeRange> {
        (self.reset_start.is_some() || self.reset_end.is_some())
            .then(|| TimeRange::new(self.reset_start, self.reset_end))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceCounts {
    pub source: String,
    pub counts: DataCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub job_id: String,
    pub sources: Vec<SourceCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_id: Option<FlushId>,
}

pub async fn ingest(config: Config, options: IngestOptions) -> Result<(), CliError> {
    let factory = Arc::new(AutodetectProcessFactory::new(config.analytics.clone()));
    let report = ingest_with(config, factory, options).await?;

    let json = serde_json::to_string_pretty(&report).map_err(std::io::Error::from)?;
    println!("{}", json);
    Ok(())
}

/// Upload every source, optionally flush, then close the job.
///
/// Ctrl-C stops the uploads; the job is closed either way.
pub async fn ingest_with(
    config: Config,
    factory: Arc<dyn ProcessFactory>,
    options: IngestOptions,
) -> Result<IngestReport, CliError> {
    if !config.jobs.contains_key(&options.job_id) {
        return Err(CliError::UnknownJob(options.job_id));
    }

    let jobs = Arc::new(InMemoryJobProvider::new(config.jobs));
    let manager = ProcessManager::builder(factory, jobs.clone())
        .settings(config.supervisor)
        .build();

    let outcome = tokio::select! {
        result = upload(&manager, &options) => result,
        _ = signal::ctrl_c() => {
            warn!(job_id = %options.job_id, "interrupted, shutting down");
            Err(CliError::Interrupted)
        }
    };

    manager.shutdown().await;

    let report = outcome?;
    match jobs.state(&options.job_id) {
        Some(state) if state.status == JobStatus::Failed => Err(CliError::JobFailed {
            job_id: options.job_id,
            reason: state.failure.unwrap_or_else(|| "unknown".to_string()),
        }),
        _ => Ok(report),
    }
}

async fn upload(
    manager: &ProcessManager,
    options: &IngestOptions,
) -> Result<IngestReport, CliError> {
    let job_id = options.job_id.as_str();
    let mut reset = options.reset();
    if reset.is_some() {
        // Buckets can only be reset in a process that is already running.
        manager.start_job(job_id).await?;
    }

    let mut sources = Vec::new();
    if options.files.is_empty() {
        info!(job_id, "reading data from stdin");
        let mut stdin = tokio::io::stdin();
        let counts = manager.process_data_load(job_id, &mut stdin, reset.take()).await?;
        sources.push(SourceCounts {
            source: "-".to_string(),
            counts,
        });
    }

    for path in &options.files {
        let mut file = tokio::fs::File::open(path).await.map_err(|source| CliError::Input {
            path: path.clone(),
            source,
        })?;
        info!(job_id, path = %path.display(), "uploading file");
        let counts = manager.process_data_load(job_id, &mut file, reset.take()).await?;
        sources.push(SourceCounts {
            source: path.display().to_string(),
            counts,
        });
    }

    let flush_id = if options.flush || options.calc_interim {
        let interim = options.calc_interim.then(|| TimeRange::new(None, None));
        Some(manager.flush_job(job_id, interim).await?)
    } else {
        None
    };

    Ok(IngestReport {
        job_id: job_id.to_string(),
        sources,
        flush_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::process::native::fake::FakeProcessFactory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
analytics:
  home: /opt/analytics
jobs:
  farequote:
    data_description:
      field_delimiter: ","
    analysis_config:
      detectors:
        - function: mean
          field_name: responsetime
"#;

    fn data_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_files_uploaded_in_order_then_flushed() {
        let config = load_config_from_str(CONFIG).unwrap();
        let factory = Arc::new(FakeProcessFactory::new());
        let first = data_file("time,responsetime\n1,10\n2,20\n");
        let second = data_file("time,responsetime\n3,30\n");

        let report = ingest_with(
            config,
            factory.clone(),
            IngestOptions {
                job_id: "farequote".to_string(),
                files: vec![first.path().to_path_buf(), second.path().to_path_buf()],
                flush: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.sources[0].counts.processed_record_count, 2);
        assert_eq!(report.sources[1].counts.processed_record_count, 1);
        assert_eq!(report.flush_id, Some(1));
        assert_eq!(factory.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_goes_to_a_started_process() {
        let config = load_config_from_str(CONFIG).unwrap();
        let factory = Arc::new(FakeProcessFactory::new());
        let data = data_file("time,responsetime\n1,10\n");

        ingest_with(
            config,
            factory.clone(),
            IngestOptions {
                job_id: "farequote".to_string(),
                files: vec![data.path().to_path_buf()],
                reset_start: Some(0),
                reset_end: Some(3600),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let controls: Vec<String> = factory
            .records()
            .into_iter()
            .filter_map(|record| record.last().cloned())
            .filter(|control| !control.is_empty() && control != ".")
            .collect();
        assert_eq!(controls, vec!["r0 3600"]);
    }

    #[tokio::test]
    async fn test_unknown_job_and_missing_file() {
        let config = load_config_from_str(CONFIG).unwrap();
        let err = ingest_with(
            config.clone(),
            Arc::new(FakeProcessFactory::new()),
            IngestOptions {
                job_id: "nope".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CliError::UnknownJob(_)));

        let err = ingest_with(
            config,
            Arc::new(FakeProcessFactory::new()),
            IngestOptions {
                job_id: "farequote".to_string(),
                files: vec![PathBuf::from("/nonexistent/data.csv")],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CliError::Input { .. }));
    }

    #[tokio::test]
    async fn test_failed_close_is_reported() {
        let config = load_config_from_str(CONFIG).unwrap();
        let factory = Arc::new(FakeProcessFactory::new().exiting_with(3, "model state corrupt\n"));
        let data = data_file("time,responsetime\n1,10\n");

        let err = ingest_with(
            config,
            factory,
            IngestOptions {
                job_id: "farequote".to_string(),
                files: vec![data.path().to_path_buf()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        match err {
            CliError::JobFailed { job_id, reason } => {
                assert_eq!(job_id, "farequote");
                assert!(reason.contains("model state corrupt"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
