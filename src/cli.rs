use std::path::PathBuf;
use clap::Parser;
use crate::config::{AppConfig, ConfigError, DEFAULT_CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(name = "station-scan")]
#[command(version = "0.1.0")]
#[command(about = "Watches a directory of station files and runs scan jobs from typed commands")]
#[command(long_about = "station-scan keeps a live per-letter aggregate of the station measurements \
in a watch directory and runs named scan jobs that copy matching rows to an output file. \
Commands (START, SCAN, STATUS, MAP, EXPORTMAP, STOP) are read from standard input.")]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Overrides `watch_directory` from the configuration
    #[arg(short, long, value_name = "PATH", help = "Directory to watch for station files")]
    pub watch_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,
}

impl Cli {
    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(!self.no_color)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.config.as_os_str().is_empty() {
            return Err("Config path must not be empty".to_string());
        }

        if let Some(dir) = &self.watch_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(format!("Path is not a directory: {}", dir.display()));
            }
        }

        Ok(())
    }

    /// Config file, then environment, then flags.
    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::load(&self.config)?.with_env_overrides();
        if let Some(dir) = &self.watch_dir {
            config.watch_directory = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_FILE),
            watch_dir: None,
            verbose: false,
            no_color: false,
        }
    }
}
