//! Core resilience primitives for the toolplane control plane.
//!
//! Three pieces, each independent of the protocol layer:
//!
//! - [`executor::BoundedExecutor`] runs an arbitrary operation under a
//!   wall-clock budget and normalizes its outcome.
//! - [`breaker::BreakerRegistry`] holds named circuit breakers that
//!   isolate callers from unreliable collaborators.
//! - [`jobs::JobCoordinator`] fans out named subtasks concurrently and
//!   rolls their outcomes up into one aggregate status.

pub mod breaker;
pub mod error;
pub mod executor;
pub mod jobs;

pub use breaker::{BreakerConfig, BreakerPhase, BreakerRegistry, BreakerSnapshot};
pub use error::{CoreError, Result};
pub use executor::{BoundedExecutor, Outcome, DEFAULT_BUDGET};
pub use jobs::{
    JobCoordinator, JobSnapshot, JobStatus, JobSummary, Subtask, SubtaskStatus, SummarySink,
};
