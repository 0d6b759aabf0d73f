//! Core error types.

use thiserror::Error;

/// Errors produced by the core primitives.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The operation did not finish within its wall-clock budget.
    #[error("operation timed out after {budget_secs}s")]
    Timeout {
        /// The budget that was exceeded, in seconds.
        budget_secs: u64,
    },

    /// The operation raised an unexpected fault (panic or abort).
    #[error("execution fault: {0}")]
    Execution(String),

    /// The named circuit breaker is open; the call was not attempted.
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen {
        /// The breaker that rejected the call.
        name: String,
    },

    /// A job run for this key is already in progress.
    #[error("job already running for key: {key}")]
    AlreadyRunning {
        /// The job key that was rejected.
        key: String,
    },

    /// No job run exists for this key.
    #[error("job not found: {0}")]
    JobNotFound(String),
}

/// Convenience alias for results in this crate.
pub type Result<T> = std::result::Result<T, CoreError>;
