use crate::config::types::JobConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Closing,
    Closed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Closed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Where job configurations come from and where status changes go.
pub trait JobProvider: Send + Sync {
    fn job(&self, job_id: &str) -> Option<JobConfig>;

    /// `reason` is only given for [`JobStatus::Failed`].
    fn set_status(&self, job_id: &str, status: JobStatus, reason: Option<&str>);

    fn state(&self, job_id: &str) -> Option<JobState>;
}

/// Jobs from the configuration file, with status kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobProvider {
    jobs: HashMap<String, JobConfig>,
    states: RwLock<HashMap<String, JobState>>,
}

impl InMemoryJobProvider {
    pub fn new(jobs: HashMap<String, JobConfig>) -> Self {
        Self {
            jobs,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl JobProvider for InMemoryJobProvider {
    fn job(&self, job_id: &str) -> Option<JobConfig> {
        self.jobs.get(job_id).cloned()
    }

    fn set_status(&self, job_id: &str, status: JobStatus, reason: Option<&str>) {
        match (status, reason) {
            (JobStatus::Failed, Some(reason)) => error!(job_id, reason, "job failed"),
            _ => info!(job_id, ?status, "job status changed"),
        }

        let finished_at = status.is_finished().then(Utc::now);
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        states.insert(
            job_id.to_string(),
            JobState {
                status,
                finished_at,
                failure: reason.map(str::to_string),
            },
        );
    }

    fn state(&self, job_id: &str) -> Option<JobState> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        states.get(job_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_support::job_from_yaml;

    #[test]
    fn test_status_transitions_record_finish_time() {
        let mut jobs = HashMap::new();
        jobs.insert("b".to_string(), job_from_yaml("analysis_config: {}"));
        jobs.insert("a".to_string(), job_from_yaml("analysis_config: {}"));
        let provider = InMemoryJobProvider::new(jobs);

        assert_eq!(provider.job_ids(), vec!["a", "b"]);
        assert!(provider.job("a").is_some());
        assert!(provider.job("c").is_none());
        assert!(provider.state("a").is_none());

        provider.set_status("a", JobStatus::Running, None);
        let running = provider.state("a").unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.finished_at.is_none());

        provider.set_status("a", JobStatus::Failed, Some("exit code 1"));
        let failed = provider.state("a").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.finished_at.is_some());
        assert_eq!(failed.failure.as_deref(), Some("exit code 1"));
    }
}
