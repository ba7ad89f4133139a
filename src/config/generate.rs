/// A commented configuration to start from, printed by `procfeed config init`.
pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# PROCFEED CONFIGURATION
# =============================================================================
# procfeed streams job data to the native analytics process, one process per
# job, started on the first upload and closed after the job has been idle.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/procfeed/config.yml
#   3. /etc/procfeed/config.yml
#
# Values may reference environment variables as $env{NAME}.

# =============================================================================
# ANALYTICS INSTALLATION
# =============================================================================

analytics:
  # Installation root. The process is started as <home>/bin/<binary> and
  # <home>/lib is added to the library search path.
  home: /opt/analytics
  binary: autodetect
  # Variable that tells the process where its installation lives
  home_env_var: ANALYTICS_HOME
  max_anomaly_records: 500
  # Optional model state persistence. Without it no persistence arguments
  # are passed and restore_snapshot_id is ignored.
  # persist_url_base: http://localhost:9200
  # persist_interval: 3h
  # quantile_interval: 6h
  # Where launch config files are written (defaults to the OS temp dir)
  # temp_dir: /var/tmp/procfeed

# =============================================================================
# SUPERVISOR
# =============================================================================

supervisor:
  # Wait between close attempts while a job is busy ingesting
  in_use_retry: 10s
  # How long a flush waits for the process to acknowledge it
  flush_ack_timeout: 30s

# =============================================================================
# JOBS
# =============================================================================
# Each job has its own process. Durations accept ms, s, m and h suffixes.

jobs:
  farequote:
    # Close the process after this much time without uploads
    timeout: 10m
    data_description:
      # delimited, json, aggregated_json or single_line
      format: delimited
      field_delimiter: ","
      quote_character: '"'
      time_field: time
      # epoch, epoch_ms, iso8601 or a strptime pattern such as '%Y-%m-%d %H:%M:%S'
      time_format: epoch
    analysis_config:
      bucket_span: 3600
      latency: 0
      detectors:
        - function: mean
          field_name: responsetime
          by_field_name: airline
      influencers: [airline]
    analysis_limits:
      model_memory_limit: 512

  web_logs:
    timeout: 30m
    data_description:
      # Each input line is offered to the transforms as the field 'raw'
      format: single_line
      time_field: timestamp
      time_format: '%d/%b/%Y:%H:%M:%S %z'
    analysis_config:
      bucket_span: 600
      detectors:
        - function: count
          by_field_name: status
    transforms:
      # Capture groups fill the outputs in order
      - transform: extract
        inputs: [raw]
        outputs: [timestamp, status]
        arguments: ['\[([^\]]+)\] "[^"]*" (\d{3})']
      # Drop health checks before they reach the analysis
      - transform: exclude
        inputs: [raw]
        condition:
          operator: match
          value: '.*GET /health.*'
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    #[test]
    fn test_starter_config_is_valid() {
        let config = load_config_from_str(&generate_starter_config()).unwrap();

        assert_eq!(config.analytics.binary, "autodetect");
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(
            config.jobs["farequote"].analysis_fields(),
            vec!["airline", "responsetime"]
        );
        assert_eq!(config.jobs["web_logs"].analysis_fields(), vec!["status"]);
    }
}
