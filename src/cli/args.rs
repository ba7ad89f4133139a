use super::CliError;
use crate::config::Config;
use crate::process::build_autodetect_command;
use std::io::Write;

/// Print the command a job's process would be started with, without starting it.
///
/// The generated config files are removed on return unless `keep_files` is set.
pub fn print_args(
    config: &Config,
    job_id: &str,
    keep_files: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let job = config
        .jobs
        .get(job_id)
        .ok_or_else(|| CliError::UnknownJob(job_id.to_string()))?;

    let command = build_autodetect_command(job_id, job, &config.analytics)?;

    for (key, value) in &command.env {
        writeln!(out, "{}={}", key, value)?;
    }
    writeln!(out, "{}", command.program.display())?;
    for arg in &command.args {
        writeln!(out, "    {}", arg)?;
    }

    if keep_files {
        for file in command.files {
            let path = file.keep().map_err(|e| CliError::Io(e.error))?;
            writeln!(out, "# kept {}", path.display())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> Config {
        load_config_from_str(&format!(
            r#"
analytics:
  home: /opt/analytics
  temp_dir: {}
jobs:
  farequote:
    analysis_config:
      bucket_span: 3600
      detectors:
        - function: mean
          field_name: responsetime
"#,
            temp_dir.path().display()
        ))
        .unwrap()
    }

    #[test]
    fn test_prints_program_and_args() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        print_args(&config(&dir), "farequote", false, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ANALYTICS_HOME=/opt/analytics\n"));
        assert!(text.contains("/opt/analytics/bin/autodetect\n"));
        assert!(text.contains("    --logid=farequote\n"));
        assert!(text.contains("    --bucketspan=3600\n"));
        assert!(text.contains("--fieldconfig="));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_keep_files() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        print_args(&config(&dir), "farequote", true, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# kept "));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_unknown_job() {
        let dir = TempDir::new().unwrap();
        let err = print_args(&config(&dir), "other", false, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, CliError::UnknownJob(ref id) if id == "other"));
    }
}
