//! Commands and queue messages
//!
//! Everything a producer can put on the [`MessageQueue`](crate::queue::MessageQueue)
//! is a [`Message`]: either an ordinary [`Command`] or the terminal
//! `Shutdown` sentinel.

pub mod parser;

use std::cmp::Ordering;
use thiserror::Error;

pub use parser::parse_command;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("too many arguments for {0}")]
    TooManyArguments(String),
    #[error("invalid argument for {command}: {argument}")]
    InvalidArgument { command: String, argument: String },
    #[error("missing value for flag: {0}")]
    MissingValue(String),
    #[error("missing required options, provided: {0}")]
    MissingOptions(String),
    #[error("invalid number format for {0}")]
    InvalidNumber(String),
    #[error("letter must be a single character")]
    InvalidLetter,
    #[error("min ({min}) must not exceed max ({max})")]
    InvalidRange { min: f64, max: f64 },
    #[error("{0} cannot be blank")]
    Blank(&'static str),
}

/// Parameters of a scan job.
///
/// Constructed through [`Scan::new`], which enforces `min <= max` and
/// non-blank output/job names.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    min: f64,
    max: f64,
    letter: char,
    output_file: String,
    job_name: String,
}

impl Scan {
    pub fn new(
        min: f64,
        max: f64,
        letter: char,
        output_file: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Result<Self, CommandError> {
        let output_file = output_file.into();
        let job_name = job_name.into();

        if output_file.trim().is_empty() {
            return Err(CommandError::Blank("output file"));
        }
        if job_name.trim().is_empty() {
            return Err(CommandError::Blank("job name"));
        }
        if min.is_nan() || max.is_nan() || min > max {
            return Err(CommandError::InvalidRange { min, max });
        }

        Ok(Self { min, max, letter, output_file, job_name })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn output_file(&self) -> &str {
        &self.output_file
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Inclusive range check used by scan subtasks.
    pub fn accepts(&self, temperature: f64) -> bool {
        temperature >= self.min && temperature <= self.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start { load_jobs: bool },
    /// Never placed on the queue; the producer turns it into `Message::Shutdown`.
    Stop { save_jobs: bool },
    Scan(Scan),
    /// `None` asks for every job.
    Status { job_name: Option<String> },
    ReportSnapshot,
    ExportSnapshot,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "START",
            Command::Stop { .. } => "STOP",
            Command::Scan(_) => "SCAN",
            Command::Status { .. } => "STATUS",
            Command::ReportSnapshot => "MAP",
            Command::ExportSnapshot => "EXPORTMAP",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Shutdown { save_jobs: bool },
}

impl Message {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Message::Shutdown { .. })
    }

    /// Queue priority: `Shutdown` sorts before every command, everything else
    /// is equal.
    pub fn priority_cmp(&self, other: &Message) -> Ordering {
        match (self, other) {
            (Message::Shutdown { .. }, Message::Command(_)) => Ordering::Less,
            (Message::Command(_), Message::Shutdown { .. }) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}
