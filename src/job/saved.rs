//! On-disk form of unfinished jobs, written on `STOP --save-jobs` and read
//! back on `START --load-jobs`.

use std::path::Path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::command::{CommandError, Scan};

pub const SAVED_JOBS_VERSION: u32 = 1;
pub const SCAN_JOB_TYPE: &str = "SCAN";

fn current_version() -> u32 {
    SAVED_JOBS_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedJobs {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<SavedJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedJob {
    pub job_name: String,
    pub job_type: String,
    pub scan_params: SavedScanParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedScanParameters {
    pub min: f64,
    pub max: f64,
    pub letter: char,
    pub output_filename: String,
}

impl SavedJob {
    pub fn from_scan(scan: &Scan) -> Self {
        Self {
            job_name: scan.job_name().to_string(),
            job_type: SCAN_JOB_TYPE.to_string(),
            scan_params: SavedScanParameters {
                min: scan.min(),
                max: scan.max(),
                letter: scan.letter(),
                output_filename: scan.output_file().to_string(),
            },
        }
    }

    pub fn to_scan(&self) -> Result<Scan, CommandError> {
        let params = &self.scan_params;
        Scan::new(
            params.min,
            params.max,
            params.letter,
            params.output_filename.clone(),
            self.job_name.clone(),
        )
    }
}

impl SavedJobs {
    pub fn from_scans<'a>(scans: impl IntoIterator<Item = &'a Scan>) -> Self {
        Self {
            version: SAVED_JOBS_VERSION,
            jobs: scans.into_iter().map(SavedJob::from_scan).collect(),
        }
    }

    /// `Ok(None)` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let saved: SavedJobs = toml::from_str(&content)
            .with_context(|| format!("Failed to parse saved jobs in {}", path.display()))?;
        if saved.version > SAVED_JOBS_VERSION {
            anyhow::bail!(
                "Saved jobs in {} use version {}, newest supported is {}",
                path.display(),
                saved.version,
                SAVED_JOBS_VERSION
            );
        }
        Ok(Some(saved))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string(self).context("Failed to serialize saved jobs")?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Scan commands to re-issue. Entries of another type or with invalid
    /// parameters are logged and dropped.
    pub fn into_scans(self) -> Vec<Scan> {
        self.jobs
            .into_iter()
            .filter_map(|job| {
                if job.job_type != SCAN_JOB_TYPE {
                    tracing::warn!("Skipping saved job {} of unknown type {}", job.job_name, job.job_type);
                    return None;
                }
                match job.to_scan() {
                    Ok(scan) => Some(scan),
                    Err(err) => {
                        tracing::warn!("Skipping saved job {}: {}", job.job_name, err);
                        None
                    }
                }
            })
            .collect()
    }
}
