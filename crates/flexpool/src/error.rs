//! Error types for the dispatcher

use thiserror::Error;

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatcher and by job completion signals
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The job ran and returned an error (delivered verbatim)
    #[error("job failed: {0}")]
    Job(#[from] anyhow::Error),

    /// The job panicked while executing
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was dropped before it ran (immediate stop or reset)
    #[error("job was abandoned before it completed")]
    Abandoned,

    /// Non-blocking submission found the intake queue at capacity
    #[error("intake queue is full")]
    QueueFull,

    /// Start was called outside a Tokio runtime
    #[error("no Tokio runtime available to spawn workers")]
    NoRuntime,

    /// Configuration rejected by validation
    #[error("invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
}

impl DispatchError {
    /// True when the job actually ran (successfully or not)
    pub fn job_ran(&self) -> bool {
        matches!(self, Self::Job(_) | Self::Panicked(_))
    }
}
