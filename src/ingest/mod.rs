//! Normalises client data into the canonical record layout and streams it
//! to the analytics process.

pub mod aggregated;
pub mod chain;
pub mod csv;
pub mod fields;
pub mod json;
pub mod persist;
pub mod single_line;
pub mod status;
pub mod timestamp;
pub mod transform;

use crate::config::types::{DataFormat, JobConfig};
use crate::wire::RecordWriter;
use async_trait::async_trait;
use chain::{RecordOutcome, TransformChain};
use fields::{FieldIndexMap, FieldMapper};
use persist::DataPersister;
use std::io;
use thiserror::Error;
use timestamp::{TimestampError, TimestampParser};
use tokio::io::AsyncRead;
use tracing::debug;
use transform::{TransformError, TransformSpec};

pub use aggregated::AggregatedJsonDataToProcessWriter;
pub use csv::{CsvDataToProcessWriter, CsvOptions};
pub use json::JsonDataToProcessWriter;
pub use single_line::SingleLineDataToProcessWriter;
pub use status::{DataCounts, StatusReporter};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("field '{field}' is missing from the input header {header:?}")]
    MissingField { field: String, header: Vec<String> },

    #[error("malformed input, giving up after {errors} parse errors: {message}")]
    MalformedInput { errors: usize, message: String },

    #[error("{message}")]
    Csv { message: String },

    #[error("failed to read input data: {0}")]
    Input(#[source] io::Error),

    #[error("failed to write to the analytics process: {0}")]
    Output(#[source] io::Error),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

/// Ingestion state that outlives a single call: owned by the process handle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestProgress {
    pub header_written: bool,
    /// High-water mark for the out-of-order check.
    pub latest_epoch: Option<i64>,
}

/// Write the header record unless this stream already has one.
pub async fn write_header_once(
    writer: &mut (dyn RecordWriter + '_),
    progress: &mut IngestProgress,
    names: &[String],
) -> io::Result<()> {
    if !progress.header_written {
        writer.write_record(names).await?;
        progress.header_written = true;
    }
    Ok(())
}

/// Configuration every format reader shares: the field mapper, the validated
/// transforms and the timestamp settings.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub mapper: FieldMapper,
    pub transforms: Vec<TransformSpec>,
    pub parser: TimestampParser,
    pub latency: i64,
}

impl RecordLayout {
    pub fn from_job(job: &JobConfig) -> Result<Self, WriteError> {
        let transforms = job
            .transforms
            .iter()
            .map(TransformSpec::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        chain::dependency_order(&transforms)?;

        let mapper = FieldMapper::new(job.time_field(), &job.analysis_fields(), &transforms);
        let parser = TimestampParser::new(&job.data_description.time_format)?;

        Ok(Self {
            mapper,
            transforms,
            parser,
            latency: job.latency_secs(),
        })
    }

    /// Resolve a header-bearing source, or the configured fields when `header` is `None`.
    pub fn build(
        &self,
        header: Option<&[String]>,
    ) -> Result<(FieldIndexMap, TransformChain), WriteError> {
        let map = match header {
            Some(header) => self.mapper.map_header(header)?,
            None => self.mapper.map_synthetic(),
        };
        let chain = TransformChain::build(
            &map,
            self.mapper.time_field(),
            &self.transforms,
            self.parser.clone(),
            self.latency,
        )?;
        Ok((map, chain))
    }
}

/// Destination of transformed records for one ingestion call.
pub struct RecordSink<'a> {
    writer: &'a mut (dyn RecordWriter + 'a),
    persister: &'a mut (dyn DataPersister + 'a),
    progress: &'a mut IngestProgress,
    reporter: StatusReporter,
}

impl<'a> RecordSink<'a> {
    pub fn new(
        job_id: &str,
        writer: &'a mut (dyn RecordWriter + 'a),
        persister: &'a mut (dyn DataPersister + 'a),
        progress: &'a mut IngestProgress,
    ) -> Self {
        Self {
            writer,
            persister,
            progress,
            reporter: StatusReporter::new(job_id),
        }
    }

    pub fn reporter(&mut self) -> &mut StatusReporter {
        &mut self.reporter
    }

    pub async fn write_header(&mut self, names: &[String]) -> Result<(), WriteError> {
        self.persister.set_field_names(names);
        write_header_once(&mut *self.writer, self.progress, names)
            .await
            .map_err(WriteError::Output)
    }

    /// Run `raw` through the chain and write it if accepted.
    pub async fn process(
        &mut self,
        chain: &mut TransformChain,
        raw: &[String],
    ) -> Result<(), WriteError> {
        let result = chain.apply(raw, &mut self.progress.latest_epoch);
        self.reporter.report_failed_transforms(result.failed_transforms);

        match result.outcome {
            RecordOutcome::Accepted { epoch } => {
                let record = chain.output();
                self.writer
                    .write_record(record)
                    .await
                    .map_err(WriteError::Output)?;
                self.persister.persist_record(epoch, record).await;

                // the trailing control field is never counted
                let values = &record[..record.len().saturating_sub(1)];
                let non_empty = values.iter().filter(|v| !v.is_empty()).count();
                self.reporter.report_record_written(epoch, non_empty);
            }
            RecordOutcome::InvalidDate => self.reporter.report_date_parse_error(),
            RecordOutcome::OutOfOrder { epoch } => {
                debug!(epoch, latest = ?self.progress.latest_epoch, "dropping out of order record");
                self.reporter.report_out_of_order();
            }
            RecordOutcome::Excluded => self.reporter.report_excluded(),
        }
        Ok(())
    }

    /// Flush the persister whatever `result` is, then the process input on success.
    async fn finish(self, result: Result<(), WriteError>) -> Result<DataCounts, WriteError> {
        self.persister.flush_records().await;
        result?;
        self.writer.flush().await.map_err(WriteError::Output)?;
        Ok(self.reporter.finish())
    }
}

/// A reader for one input format.
#[async_trait]
pub trait DataToProcessWriter: Send {
    /// Resolve field indices and transforms. Formats without a header pass `None`.
    fn build_transforms_and_header(
        &mut self,
        header: Option<&[String]>,
    ) -> Result<FieldIndexMap, WriteError>;

    /// Read `input` to the end, sending records to `sink`.
    async fn write(
        &mut self,
        input: &mut (dyn AsyncRead + Unpin + Send),
        sink: &mut RecordSink<'_>,
    ) -> Result<(), WriteError>;
}

pub fn data_to_process_writer(job: &JobConfig) -> Result<Box<dyn DataToProcessWriter>, WriteError> {
    let layout = RecordLayout::from_job(job)?;
    let description = &job.data_description;

    let writer: Box<dyn DataToProcessWriter> = match description.format {
        DataFormat::Delimited => Box::new(CsvDataToProcessWriter::new(
            layout,
            CsvOptions::from_description(description),
        )),
        DataFormat::Json => Box::new(JsonDataToProcessWriter::new(layout)),
        DataFormat::AggregatedJson => Box::new(AggregatedJsonDataToProcessWriter::new(
            layout,
            description.aggregations.clone(),
            job.analysis_config.summary_count_field_name.clone(),
        )),
        DataFormat::SingleLine => Box::new(SingleLineDataToProcessWriter::new(layout)),
    };
    Ok(writer)
}

/// Read all of `input`, transform it and write it to the process.
///
/// The persister is flushed exactly once even when an error is returned.
pub async fn write_to_process(
    job_id: &str,
    job: &JobConfig,
    input: &mut (dyn AsyncRead + Unpin + Send),
    writer: &mut (dyn RecordWriter + '_),
    persister: &mut (dyn DataPersister + '_),
    progress: &mut IngestProgress,
) -> Result<DataCounts, WriteError> {
    let mut sink = RecordSink::new(job_id, writer, persister, progress);
    let result = match data_to_process_writer(job) {
        Ok(mut data_writer) => data_writer.write(input, &mut sink).await,
        Err(e) => Err(e),
    };
    sink.finish(result).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::persist::DataPersister;
    use async_trait::async_trait;

    /// Keeps persisted records in memory.
    #[derive(Debug, Default)]
    pub struct CapturingPersister {
        pub field_names: Vec<String>,
        pub records: Vec<(i64, Vec<String>)>,
        pub flushes: usize,
    }

    #[async_trait]
    impl DataPersister for CapturingPersister {
        fn set_field_names(&mut self, names: &[String]) {
            self.field_names = names.to_vec();
        }

        async fn persist_record(&mut self, epoch: i64, record: &[String]) {
            self.records.push((epoch, record.to_vec()));
        }

        async fn flush_records(&mut self) {
            self.flushes += 1;
        }
    }

    pub fn job_from_yaml(yaml: &str) -> crate::config::types::JobConfig {
        serde_yaml::from_str(yaml).unwrap()
    }
}
