use serde::Serialize;
use tracing::{info, warn};

/// Records processed above this share of bad timestamps or out-of-order
/// times trigger a warning at the end of an ingestion call.
const WARN_RATIO: f64 = 0.25;

/// Counters for a single ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataCounts {
    pub processed_record_count: u64,
    pub processed_field_count: u64,
    pub input_bytes: u64,
    pub input_field_count: u64,
    pub input_record_count: u64,
    pub invalid_date_count: u64,
    pub missing_field_count: u64,
    pub out_of_order_time_stamp_count: u64,
    pub excluded_record_count: u64,
    pub failed_transform_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_record_time: Option<i64>,
}

impl DataCounts {
    /// Every record seen is written, rejected for its time, or excluded.
    pub fn is_conserved(&self) -> bool {
        self.processed_record_count
            + self.invalid_date_count
            + self.out_of_order_time_stamp_count
            + self.excluded_record_count
            == self.input_record_count
    }
}

/// Accumulates [`DataCounts`] and logs progress.
#[derive(Debug)]
pub struct StatusReporter {
    job_id: String,
    counts: DataCounts,
    next_milestone: u64,
}

impl StatusReporter {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            counts: DataCounts::default(),
            next_milestone: 100,
        }
    }

    pub fn counts(&self) -> &DataCounts {
        &self.counts
    }

    pub fn report_bytes_read(&mut self, bytes: usize) {
        self.counts.input_bytes += bytes as u64;
    }

    pub fn report_record_seen(&mut self, num_fields: usize) {
        self.counts.input_record_count += 1;
        self.counts.input_field_count += num_fields as u64;
    }

    pub fn report_missing_fields(&mut self, missing: usize) {
        self.counts.missing_field_count += missing as u64;
    }

    pub fn report_date_parse_error(&mut self) {
        self.counts.invalid_date_count += 1;
    }

    pub fn report_out_of_order(&mut self) {
        self.counts.out_of_order_time_stamp_count += 1;
    }

    pub fn report_excluded(&mut self) {
        self.counts.excluded_record_count += 1;
    }

    pub fn report_failed_transforms(&mut self, failed: usize) {
        self.counts.failed_transform_count += failed as u64;
    }

    pub fn report_record_written(&mut self, epoch: i64, non_empty_fields: usize) {
        self.counts.processed_record_count += 1;
        self.counts.processed_field_count += non_empty_fields as u64;
        self.counts.latest_record_time = Some(
            self.counts
                .latest_record_time
                .map_or(epoch, |latest| latest.max(epoch)),
        );

        if self.counts.processed_record_count >= self.next_milestone {
            info!(
                job_id = %self.job_id,
                records = self.counts.processed_record_count,
                "records written to the analytics process"
            );
            self.next_milestone = self.next_milestone.saturating_mul(10);
        }
    }

    /// Log the call summary and hand back the counts.
    pub fn finish(self) -> DataCounts {
        let counts = self.counts;
        let seen = counts.input_record_count;

        if seen > 0 {
            let ratio = |n: u64| n as f64 / seen as f64;
            if ratio(counts.invalid_date_count) > WARN_RATIO {
                warn!(
                    job_id = %self.job_id,
                    invalid_dates = counts.invalid_date_count,
                    records = seen,
                    "a high proportion of records had a time that could not be parsed"
                );
            }
            if ratio(counts.out_of_order_time_stamp_count) > WARN_RATIO {
                warn!(
                    job_id = %self.job_id,
                    out_of_order = counts.out_of_order_time_stamp_count,
                    records = seen,
                    "a high proportion of records were out of time order"
                );
            }
        }

        info!(
            job_id = %self.job_id,
            processed = counts.processed_record_count,
            invalid_dates = counts.invalid_date_count,
            missing_fields = counts.missing_field_count,
            out_of_order = counts.out_of_order_time_stamp_count,
            excluded = counts.excluded_record_count,
            bytes = counts.input_bytes,
            "ingestion finished"
        );
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate_and_conserve() {
        let mut reporter = StatusReporter::new("job");
        for epoch in [10, 30, 20] {
            reporter.report_record_seen(3);
            reporter.report_record_written(epoch, 2);
        }
        reporter.report_record_seen(3);
        reporter.report_date_parse_error();
        reporter.report_record_seen(3);
        reporter.report_out_of_order();
        reporter.report_record_seen(2);
        reporter.report_missing_fields(1);
        reporter.report_excluded();
        reporter.report_bytes_read(42);

        let counts = reporter.finish();
        assert_eq!(counts.input_record_count, 6);
        assert_eq!(counts.input_field_count, 17);
        assert_eq!(counts.processed_record_count, 3);
        assert_eq!(counts.processed_field_count, 6);
        assert_eq!(counts.latest_record_time, Some(30));
        assert_eq!(counts.missing_field_count, 1);
        assert_eq!(counts.input_bytes, 42);
        assert!(counts.is_conserved());
    }

    #[test]
    fn test_counts_serialize_as_json() {
        let counts = DataCounts {
            processed_record_count: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["processed_record_count"], 2);
        assert!(json.get("latest_record_time").is_none());
    }
}
