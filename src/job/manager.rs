use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use super::{Job, JobError, JobState, SavedJobs};
use crate::command::Scan;
use crate::filter;
use crate::pool::WorkerPool;

/// What `scan` decided to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Submitted,
    Duplicate,
    NoInputFiles,
    NotStarted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub job_name: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub matches: usize,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is {} (submitted {}, {} matches)",
            self.job_name,
            self.state,
            self.submitted_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.matches
        )
    }
}

/// Cancels the job if its driver is dropped before the job reached a terminal
/// state, e.g. when the manager's pool is force-stopped.
struct CancelOnDrop(Arc<Job>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.0.state().is_terminal() {
            self.0.cancel();
        }
    }
}

/// Owns every scan job of the process.
pub struct JobManager {
    jobs: DashMap<String, Arc<Job>>,
    pool: RwLock<Arc<WorkerPool>>,
    started: AtomicBool,
    watch_dir: RwLock<Option<PathBuf>>,
    jobs_file: PathBuf,
    shutdown_grace: Duration,
}

impl JobManager {
    pub fn new<P: AsRef<Path>>(jobs_file: P, shutdown_grace: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            pool: RwLock::new(Arc::new(WorkerPool::new("job-manager"))),
            started: AtomicBool::new(false),
            watch_dir: RwLock::new(None),
            jobs_file: jobs_file.as_ref().to_path_buf(),
            shutdown_grace,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn job(&self, job_name: &str) -> Option<Arc<Job>> {
        self.jobs.get(job_name).map(|job| job.value().clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub async fn init<P: AsRef<Path>>(&self, load_jobs: bool, watch_dir: P) -> Result<(), JobError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JobError::AlreadyStarted);
        }

        let watch_dir = watch_dir.as_ref().to_path_buf();
        tracing::info!("JobManager initialized with watch directory: {}", watch_dir.display());
        *self.watch_dir.write().unwrap_or_else(PoisonError::into_inner) = Some(watch_dir);

        let needs_pool = self.current_pool().is_shut_down();
        if needs_pool {
            *self.pool.write().unwrap_or_else(PoisonError::into_inner) =
                Arc::new(WorkerPool::new("job-manager"));
        }

        if load_jobs {
            self.load_saved_jobs().await;
        }
        Ok(())
    }

    /// Register and launch a scan job. Duplicate names are rejected and the
    /// existing job is left alone.
    pub async fn scan(&self, scan: Scan) -> ScanOutcome {
        if !self.is_started() {
            tracing::error!("JobManager not started, cannot execute scan");
            return ScanOutcome::NotStarted;
        }
        let job_name = scan.job_name().to_string();
        if self.jobs.contains_key(&job_name) {
            tracing::error!("Job with name {} already exists", job_name);
            return ScanOutcome::Duplicate;
        }

        tracing::info!("Starting scan job: {}", job_name);

        if let Err(err) = tokio::fs::File::create(scan.output_file()).await {
            tracing::warn!(
                "Job {} - Could not truncate output file {}: {}",
                job_name,
                scan.output_file(),
                err
            );
        }

        let files = self.files_to_process().await;
        if files.is_empty() {
            tracing::warn!("Job {} - No files to process", job_name);
            return ScanOutcome::NoInputFiles;
        }

        let job = match self.jobs.entry(job_name.clone()) {
            Entry::Occupied(_) => {
                tracing::error!("Job with name {} already exists", job_name);
                return ScanOutcome::Duplicate;
            }
            Entry::Vacant(slot) => slot.insert(Arc::new(Job::new(scan, files))).value().clone(),
        };

        let driver = Self::drive(job.clone());
        if let Err(err) = self.current_pool().submit(driver) {
            tracing::error!("Failed to start scan job {}: {}", job_name, err);
            job.cancel();
        }
        ScanOutcome::Submitted
    }

    /// Run `start()` in its own task so a panic surfaces as a `JoinError`
    /// here, and turn any failure into a cancellation.
    async fn drive(job: Arc<Job>) {
        let guard = CancelOnDrop(job.clone());
        let job_name = job.name();
        let run = {
            let job = job.clone();
            tokio::spawn(async move { job.start().await })
        };

        match run.await {
            Ok(Ok(())) => tracing::info!("Job {} - completed", job_name),
            Ok(Err(JobError::Cancelled(_))) => {
                tracing::info!("Job {} - interrupted / cancelled", job_name);
                job.cancel();
            }
            Ok(Err(err)) => {
                tracing::error!("Job {} - Error in job: {}", job_name, err);
                job.cancel();
            }
            Err(err) => {
                tracing::error!("Job {} - Job task failed: {}", job_name, err);
                job.cancel();
            }
        }
        drop(guard);
    }

    /// Status of one job, or of every job when `job_name` is `None`.
    pub fn status(&self, job_name: Option<&str>) -> Result<Vec<JobStatus>, JobError> {
        if !self.is_started() {
            tracing::error!("JobManager not started, cannot check status");
            return Err(JobError::NotStarted);
        }

        let statuses = match job_name.filter(|name| !name.is_empty()) {
            None => {
                tracing::info!("No job name provided, showing status of all jobs");
                let mut all: Vec<_> = self.jobs.iter().map(|entry| Self::status_of(entry.value())).collect();
                all.sort_by(|a, b| a.job_name.cmp(&b.job_name));
                all
            }
            Some(name) => {
                tracing::info!("Checking status of job: {}", name);
                match self.job(name) {
                    Some(job) => vec![Self::status_of(&job)],
                    None => {
                        tracing::info!("Job {} not found", name);
                        return Err(JobError::NotFound(name.to_string()));
                    }
                }
            }
        };

        for status in &statuses {
            tracing::info!("{}", status);
        }
        Ok(statuses)
    }

    /// Optionally persist unfinished jobs, then drain the manager's pool for
    /// at most the configured grace period.
    pub async fn quit(&self, save_jobs: bool) {
        if !self.is_started() {
            tracing::warn!("JobManager not started, nothing to quit");
            return;
        }

        if save_jobs {
            tracing::info!("Saving unexecuted jobs to {}", self.jobs_file.display());
            self.save_unfinished_jobs().await;
        }

        tracing::info!("Waiting for JobManager worker pool to terminate");
        self.current_pool().shutdown(self.shutdown_grace).await;

        self.started.store(false, Ordering::SeqCst);
        tracing::info!("JobManager shut down");
    }

    fn status_of(job: &Job) -> JobStatus {
        let info = job.info();
        JobStatus {
            job_name: info.job_name.clone(),
            state: info.state,
            submitted_at: job.submitted_at(),
            matches: job.total_matches(),
        }
    }

    fn current_pool(&self) -> Arc<WorkerPool> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn files_to_process(&self) -> Vec<PathBuf> {
        let Some(dir) = self.watch_dir.read().unwrap_or_else(PoisonError::into_inner).clone() else {
            return Vec::new();
        };

        match tokio::task::spawn_blocking(move || filter::list_station_files(&dir)).await {
            Ok(Ok(files)) => files,
            Ok(Err(err)) => {
                tracing::error!("Error getting files to process: {:#}", err);
                Vec::new()
            }
            Err(err) => {
                tracing::error!("Directory listing task failed: {}", err);
                Vec::new()
            }
        }
    }

    async fn load_saved_jobs(&self) {
        let saved = match SavedJobs::load(&self.jobs_file).await {
            Ok(Some(saved)) => saved,
            Ok(None) => {
                tracing::info!("No saved jobs file found");
                return;
            }
            Err(err) => {
                tracing::error!("Failed to load saved jobs: {:#}", err);
                return;
            }
        };

        let scans = saved.into_scans();
        if scans.is_empty() {
            tracing::info!("No jobs to load from saved file");
            return;
        }

        for scan in scans {
            let job_name = scan.job_name().to_string();
            self.scan(scan).await;
            tracing::info!("Loaded saved job: {}", job_name);
        }
    }

    async fn save_unfinished_jobs(&self) {
        let unfinished: Vec<Scan> = self
            .jobs
            .iter()
            .map(|entry| entry.value().info())
            .filter(|info| info.state.is_unfinished())
            .map(|info| info.scan_params.clone())
            .collect();

        if unfinished.is_empty() {
            tracing::info!("No unexecuted jobs to save");
            return;
        }

        match SavedJobs::from_scans(&unfinished).save(&self.jobs_file).await {
            Ok(()) => tracing::info!(
                "Saved {} unexecuted jobs to {}",
                unfinished.len(),
                self.jobs_file.display()
            ),
            Err(err) => tracing::error!("Failed to save jobs: {:#}", err),
        }
    }

    #[cfg(test)]
    fn register_pending(&self, scan: Scan, files: Vec<PathBuf>) -> Arc<Job> {
        let job = Arc::new(Job::new(scan, files));
        self.jobs.insert(job.name(), job.clone());
        job
    }
}
