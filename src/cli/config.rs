use super::CliError;
use crate::config::generate::generate_starter_config;
use crate::config::{user_config_path, SYSTEM_CONFIG_PATH};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Write the starter config to `~/.config/procfeed/config.yml`, falling back to
/// `/etc/procfeed/config.yml`, or print it with `stdout`.
pub fn init(stdout: bool) -> Result<(), CliError> {
    let config_content = generate_starter_config();
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let user_config = user_config_path().filter(|path| match path.parent() {
        Some(parent) => match fs::create_dir_all(parent) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("Warning: Could not create directory {}: {}", parent.display(), e);
                eprintln!("Falling back to {}", SYSTEM_CONFIG_PATH);
                false
            }
        },
        None => false,
    });
    let config_path = user_config.unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH));

    write_config(&config_content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// Refuses to replace an existing file.
pub fn write_config(config_content: &str, path: &Path) -> Result<(), CliError> {
    if path.exists() {
        return Err(CliError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "config file already exists at {}; \
                 remove it first or use --stdout to print the config",
                path.display()
            ),
        )));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use tempfile::TempDir;

    #[test]
    fn test_written_config_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.yml");

        write_config(&generate_starter_config(), &path).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.jobs.contains_key("farequote"));
    }

    #[test]
    fn test_existing_file_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "analytics: {home: /x}\n").unwrap();

        let err = write_config(&generate_starter_config(), &path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "analytics: {home: /x}\n");
    }
}
