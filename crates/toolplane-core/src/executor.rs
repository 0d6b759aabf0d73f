//! Bounded execution of arbitrary operations.
//!
//! [`BoundedExecutor`] runs an operation on its own tokio task under a
//! wall-clock budget. Whatever happens inside the operation -- normal
//! completion, explicit failure, panic, or overrun -- the caller gets a
//! typed outcome and the executor stays usable for the next call.
//!
//! Successful payloads are normalized into exactly one text content
//! value: plain strings pass through, structured payloads with a
//! recognizable human-readable field are flattened to it, and anything
//! else is rendered as pretty-printed JSON.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Default wall-clock budget for a single operation.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(30);

/// Fields checked, in order, when flattening a structured payload.
const TEXT_FIELDS: [&str; 3] = ["output", "text", "content"];

/// Outcome of a bounded execution that ran to completion within budget.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The operation succeeded; the payload normalized to text.
    Ok(String),
    /// The operation returned its own explicit failure reason.
    Failed(String),
}

/// Runs operations under a wall-clock budget with fault containment.
///
/// A timed-out operation is forcibly abandoned: its task is aborted and
/// no partial result is ever returned. A panic inside the operation is
/// caught at the task boundary and converted to
/// [`CoreError::Execution`]; it never crosses into the caller.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    budget: Duration,
}

impl Default for BoundedExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET)
    }
}

impl BoundedExecutor {
    /// Create an executor with the given default budget.
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// The default budget applied by [`execute`](Self::execute).
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Run `op` under the executor's default budget.
    pub async fn execute<F>(&self, op: F) -> Result<Outcome>
    where
        F: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.execute_with_budget(op, self.budget).await
    }

    /// Run `op` under an explicit budget, overriding the default.
    pub async fn execute_with_budget<F>(&self, op: F, budget: Duration) -> Result<Outcome>
    where
        F: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        let handle = tokio::spawn(op);
        let abort = handle.abort_handle();

        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(Ok(value))) => Ok(Outcome::Ok(normalize(value))),
            Ok(Ok(Err(reason))) => Ok(Outcome::Failed(reason)),
            Ok(Err(join_err)) => {
                // The task panicked or was aborted from elsewhere.
                let message = panic_message(join_err);
                warn!(error = %message, "operation faulted");
                Err(CoreError::Execution(message))
            }
            Err(_) => {
                // Forcibly abandon the overrunning task; no partial
                // result ever reaches the caller.
                abort.abort();
                debug!(budget_secs = budget.as_secs(), "operation exceeded budget");
                Err(CoreError::Timeout {
                    budget_secs: budget.as_secs(),
                })
            }
        }
    }
}

/// Normalize a successful payload into one text content value.
fn normalize(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Object(ref map) => {
            for field in TEXT_FIELDS {
                if let Some(Value::String(s)) = map.get(field) {
                    return s.clone();
                }
            }
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        }
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Extract a human-readable message from a join error.
fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        }
    } else {
        "task aborted".to_string()
    }
}
