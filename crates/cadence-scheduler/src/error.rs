use thiserror::Error;

/// A cron expression could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct ParseError {
    pub expression: String,
    pub reason: String,
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job schedule is malformed. Fatal at setup.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No matching minute exists within the one-year search window.
    #[error("schedule '{expression}' of job '{job}' has no run within a year")]
    ScheduleExhausted { job: String, expression: String },

    /// No job with the given name is registered.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// A job with the same name is already registered.
    #[error("Duplicate job name: {name}")]
    DuplicateJob { name: String },

    /// `start` was called on a running scheduler, or jobs were added to one.
    #[error("Scheduler is already running")]
    AlreadyRunning,
}

/// Why a single job execution failed. Caught at the dispatch boundary and
/// never propagated into the tick loop.
#[derive(Debug, Error)]
pub enum JobError {
    /// The task returned an error.
    #[error("{0:#}")]
    Failed(anyhow::Error),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
