//! Process shell: wires the queue, job manager, watcher and report service
//! together and runs the stdin reader, the command consumer and the shutdown
//! waiter.

use std::io::BufRead;
use std::sync::Arc;
use anyhow::{Context, Result};
use tokio::sync::Notify;
use crate::command::{parse_command, Command, Message};
use crate::config::AppConfig;
use crate::job::JobManager;
use crate::queue::{MessageQueue, QueueError};
use crate::report::MapReportService;
use crate::watcher::DirectoryWatcher;

#[derive(Clone)]
pub struct App {
    config: Arc<AppConfig>,
    queue: Arc<MessageQueue>,
    jobs: Arc<JobManager>,
    watcher: Arc<DirectoryWatcher>,
    reports: Arc<MapReportService>,
    /// Raised once a `Shutdown` has been emitted, so the shutdown waiter only
    /// starts taking from the queue when the sentinel is already at its head.
    shutdown_requested: Arc<Notify>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let watcher = Arc::new(DirectoryWatcher::new(
            &config.watch_directory,
            config.initial_scan_timeout(),
        ));
        let reports = Arc::new(MapReportService::new(watcher.store(), &config.export_file));
        let jobs = Arc::new(JobManager::new(&config.jobs_file, config.shutdown_grace()));

        Self {
            config: Arc::new(config),
            queue: Arc::new(MessageQueue::new()),
            jobs,
            watcher,
            reports,
            shutdown_requested: Arc::new(Notify::new()),
        }
    }

    /// Emit the shutdown sentinel and wake the shutdown waiter.
    pub fn request_shutdown(&self, save_jobs: bool) {
        request_shutdown(&self.queue, &self.shutdown_requested, save_jobs);
    }

    /// Run until a `STOP` command or Ctrl+C.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting station-scan...");

        self.watcher
            .start()
            .await
            .context("Failed to start directory watcher")?;
        self.reports.start(self.config.export_interval());

        {
            let queue = self.queue.clone();
            let signal = self.shutdown_requested.clone();
            if let Err(err) = ctrlc::set_handler(move || {
                tracing::info!("Received Ctrl+C, shutting down...");
                request_shutdown(&queue, &signal, false);
            }) {
                tracing::warn!("Failed to install Ctrl+C handler: {}", err);
            }
        }

        self.spawn_stdin_reader()?;
        let consumer = {
            let app = self.clone();
            tokio::spawn(async move { app.consume().await })
        };

        let save_jobs = self.wait_for_shutdown().await;
        self.shutdown(save_jobs).await;
        consumer.abort();

        tracing::info!("Exiting...");
        Ok(())
    }

    /// Dispatch queued commands until the shutdown sentinel shows up.
    pub async fn consume(&self) {
        loop {
            match self.queue.take().await {
                Ok(Message::Shutdown { .. }) => {
                    tracing::info!("Shutdown detected, exiting command consumer");
                    break;
                }
                Ok(Message::Command(command)) => self.handle_command(command).await,
                Err(QueueError::Interrupted) => {
                    tracing::info!("Command consumer interrupted");
                    break;
                }
                Err(err) => tracing::error!("Error taking message from queue: {}", err),
            }
        }
    }

    pub async fn handle_command(&self, command: Command) {
        tracing::debug!("Handling {} command", command.name());
        match command {
            Command::Start { load_jobs } => {
                if let Err(err) = self.jobs.init(load_jobs, &self.config.watch_directory).await {
                    tracing::error!("Cannot start job manager: {}", err);
                }
            }
            Command::Scan(scan) => {
                self.jobs.scan(scan).await;
            }
            Command::Status { job_name } => {
                if let Err(err) = self.jobs.status(job_name.as_deref()) {
                    tracing::error!("Status failed: {}", err);
                }
            }
            Command::ReportSnapshot => {
                self.reports.render();
            }
            Command::ExportSnapshot => {
                if let Err(err) = self.reports.export_csv().await {
                    tracing::error!("Export failed: {:#}", err);
                }
            }
            Command::Stop { .. } => {
                tracing::error!("STOP reached the command consumer; it must be turned into a shutdown by the reader");
            }
        }
    }

    /// Wait for a shutdown request, then take the sentinel. Returns its
    /// `save_jobs` flag.
    pub async fn wait_for_shutdown(&self) -> bool {
        self.shutdown_requested.notified().await;
        loop {
            match self.queue.take().await {
                Ok(Message::Shutdown { save_jobs }) => return save_jobs,
                Ok(Message::Command(command)) => {
                    // Only reachable if a command raced in ahead of the sentinel
                    self.handle_command(command).await;
                }
                Err(err) => {
                    tracing::error!("Error waiting for shutdown: {}", err);
                    return false;
                }
            }
        }
    }

    pub async fn shutdown(&self, save_jobs: bool) {
        tracing::info!("Shutting down (save jobs: {})", save_jobs);
        self.jobs.quit(save_jobs).await;
        self.reports.stop(self.config.report_grace()).await;
        self.watcher.stop();
    }

    fn spawn_stdin_reader(&self) -> Result<()> {
        let queue = self.queue.clone();
        let signal = self.shutdown_requested.clone();
        std::thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                let save_jobs = read_commands(stdin.lock(), &queue);
                request_shutdown(&queue, &signal, save_jobs);
            })
            .context("Failed to spawn stdin reader")?;
        Ok(())
    }
}

fn request_shutdown(queue: &MessageQueue, signal: &Notify, save_jobs: bool) {
    tracing::info!("Emitting shutdown...");
    queue.emit(Message::Shutdown { save_jobs });
    signal.notify_one();
}

/// Parse lines from `reader` and emit them as commands until `STOP` or end
/// of input. Returns the `save_jobs` flag the caller should shut down with.
pub fn read_commands<R: BufRead>(reader: R, queue: &MessageQueue) -> bool {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::error!("Error reading input: {}", err);
                return false;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Stop { save_jobs }) => return save_jobs,
            Ok(command) => {
                queue.emit(command.into());
            }
            Err(err) => tracing::error!("Error parsing command: {}", err),
        }
    }

    tracing::info!("End of input, shutting down");
    false
}
