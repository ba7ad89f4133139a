use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::ingest::chain::dependency_order;
use crate::ingest::single_line::RAW_FIELD;
use crate::ingest::timestamp::TimestampParser;
use crate::ingest::transform::TransformSpec;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    load_config_from_str(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a configuration held in memory.
pub fn load_config_from_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error.
/// Comment lines are not checked.
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<&str> = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| env_var_pattern().captures_iter(line))
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort_unstable();
    unexpanded_vars.dedup();

    let error_msg = if let [var] = unexpanded_vars.as_slice() {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            var
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables (e.g., export ANALYTICS_HOME=/opt/analytics)\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.analytics.home = expand_tilde(&config.analytics.home);
    if let Some(temp_dir) = config.analytics.temp_dir.as_mut() {
        *temp_dir = expand_tilde(temp_dir);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.analytics.home.as_os_str().is_empty() {
        errors.push("analytics.home must not be empty".to_string());
    }
    if config.analytics.binary.is_empty() {
        errors.push("analytics.binary must not be empty".to_string());
    }
    if config.supervisor.in_use_retry.is_zero() {
        errors.push("supervisor.in_use_retry must be greater than zero".to_string());
    }

    let mut job_ids: Vec<&String> = config.jobs.keys().collect();
    job_ids.sort();
    for job_id in job_ids {
        validate_job(&format!("job '{}'", job_id), &config.jobs[job_id], &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

/// Collects every problem with `job` rather than stopping at the first.
pub fn validate_job(context: &str, job: &JobConfig, errors: &mut Vec<String>) {
    if job.timeout.is_zero() {
        errors.push(format!("{}: timeout must be greater than zero", context));
    }
    if job.analysis_config.detectors.is_empty() {
        errors.push(format!("{}: analysis_config needs at least one detector", context));
    }

    let description = &job.data_description;
    if description.time_field.is_empty() {
        errors.push(format!("{}: data_description.time_field must not be empty", context));
    }
    if let Err(e) = TimestampParser::new(&description.time_format) {
        errors.push(format!("{}: {}", context, e));
    }

    match description.format {
        DataFormat::Delimited => {
            if description.field_delimiter == description.quote_character {
                errors.push(format!(
                    "{}: field_delimiter and quote_character are both {:?}",
                    context, description.field_delimiter
                ));
            }
        }
        DataFormat::AggregatedJson if description.aggregations.is_empty() => {
            errors.push(format!(
                "{}: aggregated_json input needs at least one aggregation level",
                context
            ));
        }
        DataFormat::SingleLine => {
            let reads_raw = job
                .transforms
                .iter()
                .any(|t| t.inputs.iter().any(|input| input == RAW_FIELD));
            if !reads_raw {
                errors.push(format!(
                    "{}: single_line input needs a transform that reads the '{}' field",
                    context, RAW_FIELD
                ));
            }
        }
        _ => {}
    }

    let mut specs = Vec::with_capacity(job.transforms.len());
    for (i, transform) in job.transforms.iter().enumerate() {
        match TransformSpec::from_config(transform) {
            Ok(spec) => specs.push(spec),
            Err(e) => errors.push(format!("{} transforms[{}]: {}", context, i, e)),
        }
    }
    if specs.len() == job.transforms.len() {
        if let Err(e) = dependency_order(&specs) {
            errors.push(format!("{}: {}", context, e));
        }
    }
}
