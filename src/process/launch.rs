//! Builds the analytics command line and the configuration files it reads.

use super::error::{ProcessError, ProcessResult};
use super::native::{NativeProcess, ProcessFactory};
use crate::config::types::{
    AnalysisConfig, AnalysisLimits, AnalyticsSettings, JobConfig, ModelDebugConfig,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const LOG_ID_ARG: &str = "--logid=";
pub const BUCKET_SPAN_ARG: &str = "--bucketspan=";
pub const BATCH_SPAN_ARG: &str = "--batchspan=";
pub const LATENCY_ARG: &str = "--latency=";
pub const PERIOD_ARG: &str = "--period=";
pub const SUMMARY_COUNT_FIELD_ARG: &str = "--summarycountfield=";
pub const MULTIPLE_BUCKET_SPANS_ARG: &str = "--multipleBucketspans=";
pub const RESULT_FINALIZATION_WINDOW_ARG: &str = "--resultFinalizationWindow=";
pub const MULTIVARIATE_BY_FIELDS_ARG: &str = "--multivariateByFields";
pub const PER_PARTITION_NORMALIZATION_ARG: &str = "--perPartitionNormalization";
pub const LENGTH_ENCODED_INPUT_ARG: &str = "--lengthEncodedInput";
pub const MAX_ANOMALY_RECORDS_ARG: &str = "--maxAnomalyRecords=";
pub const TIME_FIELD_ARG: &str = "--timefield=";
pub const RESTORE_SNAPSHOT_ID_ARG: &str = "--restoreSnapshotId=";
pub const PERSIST_URL_BASE_ARG: &str = "--persistUrlBase=";
pub const PERSIST_INTERVAL_ARG: &str = "--persistInterval=";
pub const MAX_QUANTILE_INTERVAL_ARG: &str = "--maxQuantileInterval=";
pub const IGNORE_DOWNTIME_ARG: &str = "--ignoreDowntime";
pub const QUANTILES_STATE_ARG: &str = "--quantilesState=";
pub const DELETE_STATE_FILES_ARG: &str = "--deleteStateFiles";
pub const MODEL_CONFIG_ARG: &str = "--modelconfig=";
pub const LIMIT_CONFIG_ARG: &str = "--limitconfig=";
pub const MODEL_DEBUG_CONFIG_ARG: &str = "--modeldebugconfig=";
pub const FIELD_CONFIG_ARG: &str = "--fieldconfig=";

pub const MODEL_CONFIG_FILE: &str = "analyticsmodel.conf";

/// Used when overlapping buckets are on and no window is configured.
pub const DEFAULT_RESULT_FINALIZATION_WINDOW: u64 = 2;

const BASE_PERSIST_INTERVAL_SECS: u64 = 3 * 60 * 60;
const BASE_MAX_QUANTILE_INTERVAL_SECS: u64 = 6 * 60 * 60;
const SECONDS_IN_HOUR: u64 = 60 * 60;

/// Everything needed to start one analytics process.
#[derive(Debug)]
pub struct AutodetectCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// The complete environment; nothing is inherited.
    pub env: Vec<(String, String)>,
    pub files: Vec<TempPath>,
}

impl AutodetectCommand {
    /// The command line as it would be typed, for logging.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Spread periodic work of different jobs over an hour.
///
/// FNV-1a of the job id so the offset is stable across restarts.
pub fn staggering_interval(job_id: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in job_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash % SECONDS_IN_HOUR
}

fn library_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(windows) {
        "Path"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// The two variables the analytics process needs to find its installation.
pub fn process_environment(settings: &AnalyticsSettings) -> Vec<(String, String)> {
    let home = &settings.home;
    let separator = if cfg!(windows) { ";" } else { ":" };
    let lib_path = format!(
        "{}{}{}",
        home.join("lib").display(),
        separator,
        home.join("cots").join("lib").display()
    );
    vec![
        (settings.home_env_var.clone(), home.display().to_string()),
        (library_path_var().to_string(), lib_path),
    ]
}

/// Arguments derived from the job alone; no files are written.
pub fn build_base_args(job_id: &str, job: &JobConfig, settings: &AnalyticsSettings) -> Vec<String> {
    let mut args = vec![format!("{LOG_ID_ARG}{job_id}")];
    add_analysis_args(&job.analysis_config, &mut args);

    args.push(LENGTH_ENCODED_INPUT_ARG.to_string());
    args.push(format!("{MAX_ANOMALY_RECORDS_ARG}{}", settings.max_anomaly_records));
    args.push(format!("{TIME_FIELD_ARG}{}", job.time_field()));

    let stagger = staggering_interval(job_id);
    debug!(job_id, stagger_secs = stagger, "periodic operations staggered");

    if let Some(base) = &settings.persist_url_base {
        if let Some(snapshot) = job.restore_snapshot_id.as_deref().filter(|s| !s.is_empty()) {
            args.push(format!("{RESTORE_SNAPSHOT_ID_ARG}{snapshot}"));
        }
        args.push(format!("{PERSIST_URL_BASE_ARG}{}/{job_id}", base.trim_end_matches('/')));

        let interval = settings
            .persist_interval
            .map(|d| d.as_secs())
            .unwrap_or(BASE_PERSIST_INTERVAL_SECS + stagger);
        args.push(format!("{PERSIST_INTERVAL_ARG}{interval}"));
    } else {
        debug!(job_id, "no persist url configured, model state will not be persisted");
    }

    let quantile_interval = settings
        .quantile_interval
        .map(|d| d.as_secs())
        .unwrap_or(BASE_MAX_QUANTILE_INTERVAL_SECS + stagger);
    args.push(format!("{MAX_QUANTILE_INTERVAL_ARG}{quantile_interval}"));

    if job.ignore_downtime {
        args.push(IGNORE_DOWNTIME_ARG.to_string());
    }
    args
}

fn add_analysis_args(config: &AnalysisConfig, args: &mut Vec<String>) {
    let numeric = [
        (BUCKET_SPAN_ARG, config.bucket_span),
        (BATCH_SPAN_ARG, config.batch_span),
        (LATENCY_ARG, config.latency),
        (PERIOD_ARG, config.period),
    ];
    for (arg, value) in numeric {
        if let Some(value) = value {
            args.push(format!("{arg}{value}"));
        }
    }
    if let Some(field) = &config.summary_count_field_name {
        args.push(format!("{SUMMARY_COUNT_FIELD_ARG}{field}"));
    }
    if !config.multiple_bucket_spans.is_empty() {
        let spans: Vec<String> = config.multiple_bucket_spans.iter().map(u64::to_string).collect();
        args.push(format!("{MULTIPLE_BUCKET_SPANS_ARG}{}", spans.join(",")));
    }
    if config.overlapping_buckets {
        let window = config
            .result_finalization_window
            .unwrap_or(DEFAULT_RESULT_FINALIZATION_WINDOW);
        args.push(format!("{RESULT_FINALIZATION_WINDOW_ARG}{window}"));
    }
    if config.multivariate_by_fields {
        args.push(MULTIVARIATE_BY_FIELDS_ARG.to_string());
    }
    if config.per_partition_normalization {
        args.push(PER_PARTITION_NORMALIZATION_ARG.to_string());
    }
}

pub fn limits_config(limits: &AnalysisLimits) -> String {
    let mut contents = String::from("[memory]\n");
    if let Some(limit) = limits.model_memory_limit.filter(|l| *l > 0) {
        let _ = writeln!(contents, "modelmemorylimit = {limit}");
    }
    if let Some(examples) = limits.categorization_examples_limit {
        let _ = write!(contents, "[results]\nmaxexamples = {examples}\n");
    }
    contents
}

pub fn model_debug_config(config: &ModelDebugConfig) -> String {
    let mut contents = String::from("[modelDebugConfig]\n");
    let _ = writeln!(contents, "boundspercentile = {}", config.bounds_percentile);
    if let Some(terms) = config.terms.as_deref().filter(|t| !t.is_empty()) {
        let _ = writeln!(contents, "terms = {terms}");
    }
    contents
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// One block of `key.option = value` lines per detector.
///
/// Detectors that produce an already seen key are skipped.
pub fn field_config(config: &AnalysisConfig) -> String {
    let mut contents = String::new();
    let mut keys = HashSet::new();

    for detector in &config.detectors {
        let function = non_empty(&detector.function);
        let field = non_empty(&detector.field_name);
        let by = non_empty(&detector.by_field_name);
        let over = non_empty(&detector.over_field_name);
        let partition = non_empty(&detector.partition_field_name);

        let mut key = match (function, field) {
            (Some(function), Some(field)) => format!("{function}({field})"),
            (Some(function), None) => function.to_string(),
            (None, Some(field)) => field.to_string(),
            (None, None) => "count".to_string(),
        };
        for split in [by, over, partition].into_iter().flatten() {
            key.push('-');
            key.push_str(split);
        }

        if !keys.insert(key.clone()) {
            warn!(key = %key, "duplicate detector key, ignoring this detector");
            continue;
        }

        if detector.use_null.is_none() && by.is_none() && over.is_none() && partition.is_none() {
            let _ = writeln!(contents, "{key}.isEnabled = true");
        }
        if let Some(use_null) = detector.use_null {
            let _ = writeln!(contents, "{key}.useNull = {use_null}");
        }
        if let Some(exclude) = non_empty(&detector.exclude_frequent) {
            let _ = writeln!(contents, "{key}.excludefrequent = {exclude}");
        }
        if let Some(by) = by {
            let _ = writeln!(contents, "{key}.by = {by}");
        }
        if let Some(over) = over {
            let _ = writeln!(contents, "{key}.over = {over}");
        }
        if let Some(partition) = partition {
            let _ = writeln!(contents, "{key}.partition = {partition}");
        }
    }
    contents
}

fn write_temp_file(dir: &Path, prefix: &str, suffix: &str, contents: &str) -> io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// The full launch description, with configuration files written to the temp dir.
pub fn build_autodetect_command(
    job_id: &str,
    job: &JobConfig,
    settings: &AnalyticsSettings,
) -> io::Result<AutodetectCommand> {
    let temp_dir = settings.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let mut args = build_base_args(job_id, job, settings);
    let mut files = Vec::new();

    if let Some(state) = &job.quantiles_state {
        let path = write_temp_file(&temp_dir, &format!("{job_id}_quantiles_"), ".json", state)?;
        args.push(format!("{QUANTILES_STATE_ARG}{}", path.display()));
        args.push(DELETE_STATE_FILES_ARG.to_string());
        files.push(path);
    }

    let model_config = settings.home.join("config").join(MODEL_CONFIG_FILE);
    if model_config.is_file() {
        args.push(format!("{MODEL_CONFIG_ARG}{}", model_config.display()));
    }

    if let Some(limits) = &job.analysis_limits {
        let path = write_temp_file(&temp_dir, "limitconfig", ".conf", &limits_config(limits))?;
        args.push(format!("{LIMIT_CONFIG_ARG}{}", path.display()));
        files.push(path);
    }

    if let Some(debug_config) = &job.model_debug_config {
        let path = write_temp_file(
            &temp_dir,
            "modeldebugconfig",
            ".conf",
            &model_debug_config(debug_config),
        )?;
        args.push(format!("{MODEL_DEBUG_CONFIG_ARG}{}", path.display()));
        files.push(path);
    }

    let fields = field_config(&job.analysis_config);
    debug!(job_id, field_config = %fields, "writing field config");
    let path = write_temp_file(&temp_dir, "fieldconfig", ".conf", &fields)?;
    args.push(format!("{FIELD_CONFIG_ARG}{}", path.display()));
    files.push(path);

    Ok(AutodetectCommand {
        program: settings.home.join("bin").join(&settings.binary),
        args,
        env: process_environment(settings),
        files,
    })
}

/// Spawn, retrying briefly while the executable is still being written (ETXTBSY).
pub async fn spawn_with_retry(command: &mut Command) -> io::Result<tokio::process::Child> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(26) && attempt < 4 => {
                attempt += 1;
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Starts the real analytics binary.
#[derive(Debug, Clone)]
pub struct AutodetectProcessFactory {
    settings: AnalyticsSettings,
}

impl AutodetectProcessFactory {
    pub fn new(settings: AnalyticsSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ProcessFactory for AutodetectProcessFactory {
    async fn create(&self, job_id: &str, job: &JobConfig) -> ProcessResult<NativeProcess> {
        let launch_error = |source| ProcessError::Launch {
            job_id: job_id.to_string(),
            source,
        };

        let launch = build_autodetect_command(job_id, job, &self.settings).map_err(launch_error)?;
        info!(job_id, command = %launch.display(), "starting analytics process");

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = spawn_with_retry(&mut command).await.map_err(launch_error)?;
        debug!(job_id, pid = ?child.id(), "analytics process started");
        NativeProcess::from_child(child, launch.files).map_err(launch_error)
    }
}
