//! Scan jobs
//!
//! A [`Job`] runs one scan over the station files that were in the watch
//! directory when it was submitted. Its state only moves forward:
//!
//! ```text
//! Pending -> Running -> Completed
//!    \          \
//!     `----------`----> Cancelled
//! ```
//!
//! The current [`JobInfo`] is published as a whole through an `Arc`, so a
//! status reader holding an older value never sees half a transition.

pub mod manager;
pub mod saved;
pub mod task;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use crate::command::Scan;
use crate::pool::WorkerPool;

pub use manager::{JobManager, JobStatus, ScanOutcome};
pub use saved::{SavedJob, SavedJobs, SavedScanParameters};
pub use task::FileScanTask;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job manager is already started")]
    AlreadyStarted,
    #[error("job manager is not started")]
    NotStarted,
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} was cancelled")]
    Cancelled(String),
    #[error("job {job} cannot move from {from} to {to}")]
    InvalidTransition {
        job: String,
        from: JobState,
        to: JobState,
    },
    #[error("job {job}: subtask for {file} failed")]
    Subtask {
        job: String,
        file: PathBuf,
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    /// Unfinished jobs are the ones saved on shutdown.
    pub fn is_unfinished(self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub job_name: String,
    pub scan_params: Scan,
    pub state: JobState,
}

impl JobInfo {
    fn with_state(&self, state: JobState) -> Self {
        Self {
            job_name: self.job_name.clone(),
            scan_params: self.scan_params.clone(),
            state,
        }
    }
}

pub struct Job {
    files: Vec<PathBuf>,
    /// Matches written per input file.
    results: DashMap<PathBuf, usize>,
    pool: WorkerPool,
    info: RwLock<Arc<JobInfo>>,
    submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(scan: Scan, files: Vec<PathBuf>) -> Self {
        let job_name = scan.job_name().to_string();
        Self {
            files,
            results: DashMap::new(),
            pool: WorkerPool::new(format!("job-{job_name}")),
            info: RwLock::new(Arc::new(JobInfo {
                job_name,
                scan_params: scan,
                state: JobState::Pending,
            })),
            submitted_at: Utc::now(),
        }
    }

    pub fn info(&self) -> Arc<JobInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn name(&self) -> String {
        self.info().job_name.clone()
    }

    pub fn state(&self) -> JobState {
        self.info().state
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn matches_for(&self, file: &Path) -> Option<usize> {
        self.results.get(file).map(|count| *count)
    }

    pub fn total_matches(&self) -> usize {
        self.results.iter().map(|entry| *entry.value()).sum()
    }

    /// Run the scan to completion.
    ///
    /// One subtask per file goes to the job's pool, and everything submitted
    /// so far is awaited before the next file is dispatched, so files finish
    /// one after another. A file that cannot be read is logged and skipped;
    /// a subtask that panics or is aborted fails the whole run.
    pub async fn start(&self) -> Result<(), JobError> {
        let info = self.transition(JobState::Running)?;
        let job_name = info.job_name.clone();
        let mut submitted: Vec<(PathBuf, JoinHandle<anyhow::Result<usize>>)> = Vec::new();

        for file in &self.files {
            let task = FileScanTask::new(file.clone(), info.scan_params.clone());
            let handle = self
                .pool
                .submit(task.run())
                .map_err(|_| JobError::Cancelled(job_name.clone()))?;
            submitted.push((file.clone(), handle));

            // TODO: let files run in parallel once output writes go through a
            // single writer per job; waiting here keeps completion sequential.
            for (path, handle) in submitted.drain(..) {
                match handle.await {
                    Ok(Ok(count)) => {
                        self.results.insert(path, count);
                    }
                    Ok(Err(err)) => {
                        tracing::error!("{} - Skipping {}: {:#}", job_name, path.display(), err);
                    }
                    Err(err) if err.is_cancelled() => {
                        return Err(JobError::Cancelled(job_name));
                    }
                    Err(source) => {
                        return Err(JobError::Subtask { job: job_name, file: path, source });
                    }
                }
            }
        }

        self.transition(JobState::Completed)?;
        self.pool.shutdown_now();
        Ok(())
    }

    /// Mark the job cancelled, abort outstanding subtasks and close its pool.
    /// Returns `false` if the job had already finished or been cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.transition(JobState::Cancelled).is_ok();
        let aborted = self.pool.shutdown_now();
        if cancelled {
            tracing::info!("{} - cancelled, aborted {} subtask(s)", self.name(), aborted);
        }
        cancelled
    }

    fn transition(&self, next: JobState) -> Result<Arc<JobInfo>, JobError> {
        let mut guard = self.info.write().unwrap_or_else(PoisonError::into_inner);
        let current = guard.state;

        if !current.can_transition_to(next) {
            let job = guard.job_name.clone();
            return Err(match current {
                JobState::Cancelled => JobError::Cancelled(job),
                from => JobError::InvalidTransition { job, from, to: next },
            });
        }

        let info = Arc::new(guard.with_state(next));
        *guard = info.clone();
        Ok(info)
    }
}
