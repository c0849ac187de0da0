//! Configuration for station-scan
//!
//! Settings come from an optional TOML file (`config.toml` by default),
//! then `STATION_SCAN_*` environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the station files
    pub watch_directory: PathBuf,
    /// Where unfinished jobs are saved on `STOP --save-jobs`
    pub jobs_file: PathBuf,
    /// Target of `EXPORTMAP` and the periodic export
    pub export_file: PathBuf,
    pub export_interval_secs: u64,
    /// How long `STOP` waits for running jobs before aborting them
    pub shutdown_grace_ms: u64,
    pub report_grace_secs: u64,
    pub initial_scan_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watch_directory: PathBuf::from("watch"),
            jobs_file: PathBuf::from("load_config.toml"),
            export_file: PathBuf::from("meteorological_data_map.csv"),
            export_interval_secs: 60,
            shutdown_grace_ms: 2000,
            report_grace_secs: 10,
            initial_scan_timeout_secs: 300, // 5 minutes
        }
    }
}

impl AppConfig {
    /// Load from `path`. A missing file gives the defaults; a file that
    /// exists but cannot be read or parsed is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `STATION_SCAN_*` overrides. Values that do not parse are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok());
        self
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(val) = var("STATION_SCAN_WATCH_DIRECTORY") {
            self.watch_directory = PathBuf::from(val);
        }
        if let Some(val) = var("STATION_SCAN_JOBS_FILE") {
            self.jobs_file = PathBuf::from(val);
        }
        if let Some(val) = var("STATION_SCAN_EXPORT_FILE") {
            self.export_file = PathBuf::from(val);
        }

        let numbers: [(&str, &mut u64); 4] = [
            ("STATION_SCAN_EXPORT_INTERVAL_SECS", &mut self.export_interval_secs),
            ("STATION_SCAN_SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms),
            ("STATION_SCAN_REPORT_GRACE_SECS", &mut self.report_grace_secs),
            ("STATION_SCAN_INITIAL_SCAN_TIMEOUT_SECS", &mut self.initial_scan_timeout_secs),
        ];
        for (key, field) in numbers {
            if let Some(val) = var(key) {
                match val.parse::<u64>() {
                    Ok(parsed) => *field = parsed,
                    Err(_) => tracing::warn!("Ignoring {}={}: not a number", key, val),
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("watch_directory must not be empty".to_string()));
        }
        if self.jobs_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("jobs_file must not be empty".to_string()));
        }
        if self.export_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("export_file must not be empty".to_string()));
        }
        if self.export_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "export_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.initial_scan_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "initial_scan_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn report_grace(&self) -> Duration {
        Duration::from_secs(self.report_grace_secs)
    }

    pub fn initial_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_scan_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.watch_directory, PathBuf::from("watch"));
        assert_eq!(config.jobs_file, PathBuf::from("load_config.toml"));
        assert_eq!(config.export_file, PathBuf::from("meteorological_data_map.csv"));
        assert_eq!(config.export_interval(), Duration::from_secs(60));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(config.initial_scan_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(dir.path().join("config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "watch_directory = \"data\"\nexport_interval_secs = 5\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.watch_directory, PathBuf::from("data"));
        assert_eq!(config.export_interval_secs, 5);
        assert_eq!(config.jobs_file, PathBuf::from("load_config.toml"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "watch_directory = [1, 2").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.export_interval_secs = 0;
        assert!(config.validate().is_err());

        config.export_interval_secs = 60;
        config.watch_directory = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STATION_SCAN_WATCH_DIRECTORY", "/data/stations"),
            ("STATION_SCAN_SHUTDOWN_GRACE_MS", "500"),
            ("STATION_SCAN_EXPORT_INTERVAL_SECS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.watch_directory, PathBuf::from("/data/stations"));
        assert_eq!(config.shutdown_grace(), Duration::from_millis(500));
        assert_eq!(config.export_interval_secs, 60);
    }
}
