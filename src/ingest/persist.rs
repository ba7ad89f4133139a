use async_trait::async_trait;

/// Receives every record written to the analytics process, for storage
/// alongside the results.
#[async_trait]
pub trait DataPersister: Send {
    fn set_field_names(&mut self, names: &[String]);

    async fn persist_record(&mut self, epoch: i64, record: &[String]);

    /// Called exactly once at the end of every ingestion call, including failed ones.
    async fn flush_records(&mut self);
}

/// Creates a persister for each ingestion call.
pub trait DataPersisterFactory: Send + Sync {
    fn persister_for(&self, job_id: &str) -> Box<dyn DataPersister>;
}

/// Discards records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneDataPersister;

#[async_trait]
impl DataPersister for NoneDataPersister {
    fn set_field_names(&mut self, _names: &[String]) {}

    async fn persist_record(&mut self, _epoch: i64, _record: &[String]) {}

    async fn flush_records(&mut self) {}
}

impl DataPersisterFactory for NoneDataPersister {
    fn persister_for(&self, _job_id: &str) -> Box<dyn DataPersister> {
        Box::new(NoneDataPersister)
    }
}
