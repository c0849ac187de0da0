pub mod aggregate;
pub mod app;
pub mod cli;
pub mod command;
pub mod config;
pub mod filter;
pub mod job;
pub mod pool;
pub mod queue;
pub mod report;
pub mod watcher;

pub use aggregate::{AggregateEntry, AggregateSnapshot, AggregateStore, SnapshotSource};
pub use app::App;
pub use command::{parse_command, Command, CommandError, Message, Scan};
pub use config::AppConfig;
pub use job::{Job, JobError, JobInfo, JobManager, JobState};
pub use queue::{MessageQueue, QueueError};
pub use report::MapReportService;
pub use watcher::DirectoryWatcher;
