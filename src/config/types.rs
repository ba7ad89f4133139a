use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub analytics: AnalyticsSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub jobs: HashMap<String, JobConfig>,
}

/// Where the analytics installation lives and how its process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSettings {
    pub home: PathBuf,
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_home_env_var")]
    pub home_env_var: String,
    #[serde(default = "default_max_anomaly_records")]
    pub max_anomaly_records: u32,
    #[serde(default)]
    pub persist_url_base: Option<String>,
    /// Explicit persist interval; when absent a per-job staggered default is used.
    #[serde(default, with = "duration_format::option")]
    pub persist_interval: Option<Duration>,
    /// Explicit quantile output interval; when absent a per-job staggered default is used.
    #[serde(default, with = "duration_format::option")]
    pub quantile_interval: Option<Duration>,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_binary() -> String {
    "autodetect".to_string()
}

fn default_home_env_var() -> String {
    "ANALYTICS_HOME".to_string()
}

fn default_max_anomaly_records() -> u32 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Backoff between close attempts while a job is busy ingesting.
    #[serde(default = "default_in_use_retry", with = "duration_format")]
    pub in_use_retry: Duration,
    #[serde(default = "default_flush_ack_timeout", with = "duration_format")]
    pub flush_ack_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            in_use_retry: default_in_use_retry(),
            flush_ack_timeout: default_flush_ack_timeout(),
        }
    }
}

fn default_in_use_retry() -> Duration {
    Duration::from_secs(10)
}

fn default_flush_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Idle time after which the job's process is closed.
    #[serde(default = "default_job_timeout", with = "duration_format")]
    pub timeout: Duration,
    #[serde(default)]
    pub data_description: DataDescription,
    pub analysis_config: AnalysisConfig,
    #[serde(default)]
    pub analysis_limits: Option<AnalysisLimits>,
    #[serde(default)]
    pub model_debug_config: Option<ModelDebugConfig>,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    #[serde(default)]
    pub restore_snapshot_id: Option<String>,
    /// Normalisation quantiles handed to the process at start-up.
    #[serde(default)]
    pub quantiles_state: Option<String>,
    #[serde(default)]
    pub ignore_downtime: bool,
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(600)
}

impl JobConfig {
    pub fn time_field(&self) -> &str {
        &self.data_description.time_field
    }

    /// Fields the analysis consumes, sorted, excluding the time field.
    pub fn analysis_fields(&self) -> Vec<String> {
        let mut fields = BTreeSet::new();
        let config = &self.analysis_config;

        for detector in &config.detectors {
            let names = [
                &detector.field_name,
                &detector.by_field_name,
                &detector.over_field_name,
                &detector.partition_field_name,
            ];
            for name in names.into_iter().flatten() {
                fields.insert(name.clone());
            }
        }
        fields.extend(config.influencers.iter().cloned());
        if let Some(summary) = &config.summary_count_field_name {
            fields.insert(summary.clone());
        }

        fields.remove(self.time_field());
        fields.retain(|f| !f.is_empty());
        fields.into_iter().collect()
    }

    /// Out-of-order tolerance in seconds.
    pub fn latency_secs(&self) -> i64 {
        self.analysis_config
            .latency
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDescription {
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default = "default_time_field")]
    pub time_field: String,
    /// `epoch`, `epoch_ms`, `iso8601` or a strptime pattern.
    #[serde(default = "default_time_format")]
    pub time_format: String,
    #[serde(default = "default_field_delimiter")]
    pub field_delimiter: char,
    #[serde(default = "default_quote_character")]
    pub quote_character: char,
    #[serde(default = "default_line_terminator")]
    pub line_terminator: char,
    /// Grouping levels of aggregated JSON input, outermost first.
    #[serde(default)]
    pub aggregations: Vec<String>,
}

impl Default for DataDescription {
    fn default() -> Self {
        Self {
            format: DataFormat::default(),
            time_field: default_time_field(),
            time_format: default_time_format(),
            field_delimiter: default_field_delimiter(),
            quote_character: default_quote_character(),
            line_terminator: default_line_terminator(),
            aggregations: Vec::new(),
        }
    }
}

fn default_time_field() -> String {
    "time".to_string()
}

fn default_time_format() -> String {
    "epoch".to_string()
}

fn default_field_delimiter() -> char {
    '\t'
}

fn default_quote_character() -> char {
    '"'
}

fn default_line_terminator() -> char {
    '\n'
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    #[default]
    Delimited,
    Json,
    AggregatedJson,
    SingleLine,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub bucket_span: Option<u64>,
    pub batch_span: Option<u64>,
    pub latency: Option<u64>,
    pub period: Option<u64>,
    pub summary_count_field_name: Option<String>,
    #[serde(default)]
    pub multiple_bucket_spans: Vec<u64>,
    #[serde(default)]
    pub overlapping_buckets: bool,
    pub result_finalization_window: Option<u64>,
    #[serde(default)]
    pub multivariate_by_fields: bool,
    #[serde(default)]
    pub per_partition_normalization: bool,
    #[serde(default)]
    pub detectors: Vec<Detector>,
    #[serde(default)]
    pub influencers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detector {
    pub function: Option<String>,
    pub field_name: Option<String>,
    pub by_field_name: Option<String>,
    pub over_field_name: Option<String>,
    pub partition_field_name: Option<String>,
    pub use_null: Option<bool>,
    pub exclude_frequent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisLimits {
    /// Megabytes.
    pub model_memory_limit: Option<u64>,
    pub categorization_examples_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDebugConfig {
    pub bounds_percentile: f64,
    #[serde(default)]
    pub terms: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub transform: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub condition: Option<ConditionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub operator: ConditionOperator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Match,
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

// Custom serde module for duration parsing
pub(crate) mod duration_format {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::{format_duration, parse_duration};
        use serde::{self, Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => parse_duration(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }

        let (value_str, unit) = if let Some(v) = s.strip_suffix("ms") {
            (v, "ms")
        } else if let Some(v) = s.strip_suffix('s') {
            (v, "s")
        } else if let Some(v) = s.strip_suffix('m') {
            (v, "m")
        } else if let Some(v) = s.strip_suffix('h') {
            (v, "h")
        } else {
            return Err(format!("invalid duration format: {}", s));
        };

        let value: u64 = value_str
            .parse()
            .map_err(|_| format!("invalid numeric value: {}", value_str))?;

        let duration = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            _ => Duration::from_secs(value * 3600),
        };

        Ok(duration)
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        if d.subsec_millis() != 0 || secs == 0 {
            format!("{}ms", d.as_millis())
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }
}
