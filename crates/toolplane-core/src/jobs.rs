//! Fan-out/fan-in job coordination.
//!
//! A job is a set of named subtasks run concurrently for one key (for
//! example, several indexing passes over one project path). The
//! [`JobCoordinator`] dispatches every subtask through the
//! [`BoundedExecutor`](crate::executor::BoundedExecutor), merges their
//! terminal reports through a single `update` entry point, and rolls
//! them up into one aggregate status. On completion a durable
//! [`JobSummary`] is handed to the [`SummarySink`] collaborator exactly
//! once.
//!
//! A subtask's failure never aborts its siblings; it is recorded and
//! the rest run to completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::executor::{BoundedExecutor, Outcome};

/// One independently executed unit within a job run.
#[async_trait]
pub trait Subtask: Send + Sync {
    /// Subtask name, unique within its job.
    fn name(&self) -> &str;

    /// Run the subtask for the given job key.
    async fn run(&self, key: &str) -> std::result::Result<Value, String>;
}

/// Collaborator that persists one summary per completed run.
#[async_trait]
pub trait SummarySink: Send + Sync {
    /// Persist the summary. Storage format is the sink's business.
    async fn persist(&self, summary: JobSummary);
}

/// Durable record derived from the results of all subtasks.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    /// Human-readable roll-up.
    pub text: String,
    /// Structured fields (run id, key, fingerprint, per-subtask states).
    pub metadata: BTreeMap<String, Value>,
}

/// Aggregate lifecycle of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Subtasks are in flight.
    Running,
    /// Every subtask finished with `done`.
    Completed,
    /// Every subtask is terminal but at least one is not `done`.
    Partial,
}

/// Lifecycle of one subtask within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Dispatched and in flight.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an explicit failure or fault.
    Error,
    /// Abandoned after exceeding its budget.
    Timeout,
}

impl SubtaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Timeout)
    }
}

/// Point-in-time view of a run, as returned by
/// [`JobCoordinator::status`].
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Run identifier.
    pub id: Uuid,
    /// Aggregate status.
    pub status: JobStatus,
    /// Job key (e.g. target path).
    pub key: String,
    /// Content fingerprint the run was started with.
    pub fingerprint: String,
    /// Time since start, frozen at finish once terminal.
    pub elapsed: Duration,
    /// Per-subtask progress.
    pub progress: BTreeMap<String, SubtaskStatus>,
    /// Per-subtask result payloads.
    pub results: BTreeMap<String, Value>,
    /// Aggregate error, if any.
    pub error: Option<String>,
}

/// Mutable run state. Mutated only under its own mutex; the coordinator
/// is the single place progress is merged.
struct JobRun {
    id: Uuid,
    status: JobStatus,
    key: String,
    fingerprint: String,
    start_time: DateTime<Utc>,
    finish_time: Option<DateTime<Utc>>,
    progress: BTreeMap<String, SubtaskStatus>,
    results: BTreeMap<String, Value>,
    error: Option<String>,
    summary_sent: bool,
}

impl JobRun {
    fn snapshot(&self) -> JobSnapshot {
        let elapsed = self
            .finish_time
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.start_time)
            .to_std()
            .unwrap_or_default();
        JobSnapshot {
            id: self.id,
            status: self.status,
            key: self.key.clone(),
            fingerprint: self.fingerprint.clone(),
            elapsed,
            progress: self.progress.clone(),
            results: self.results.clone(),
            error: self.error.clone(),
        }
    }

    /// Apply the aggregate transition if every subtask is terminal.
    ///
    /// Returns the summary to persist, at most once per run.
    fn try_finish(&mut self) -> Option<JobSummary> {
        if self.status != JobStatus::Running {
            return None;
        }
        if !self.progress.values().all(|s| s.is_terminal()) {
            return None;
        }

        let total = self.progress.len();
        let done = self
            .progress
            .values()
            .filter(|s| **s == SubtaskStatus::Done)
            .count();

        self.status = if done == total {
            JobStatus::Completed
        } else {
            JobStatus::Partial
        };
        self.finish_time = Some(Utc::now());

        if done < total {
            let incomplete: Vec<&str> = self
                .progress
                .iter()
                .filter(|(_, s)| **s != SubtaskStatus::Done)
                .map(|(name, _)| name.as_str())
                .collect();
            self.error = Some(format!(
                "{} subtask(s) did not complete: {}",
                total - done,
                incomplete.join(", ")
            ));
        }

        if self.summary_sent {
            return None;
        }
        self.summary_sent = true;

        let mut metadata = BTreeMap::new();
        metadata.insert("run_id".to_string(), json!(self.id.to_string()));
        metadata.insert("key".to_string(), json!(self.key));
        metadata.insert("fingerprint".to_string(), json!(self.fingerprint));
        metadata.insert("status".to_string(), json!(self.status));
        metadata.insert("subtasks".to_string(), json!(self.progress));

        Some(JobSummary {
            text: format!(
                "job {} finished: {}/{} subtasks succeeded",
                self.key, done, total
            ),
            metadata,
        })
    }
}

/// Coordinates concurrent subtask pipelines, one active run per key.
pub struct JobCoordinator {
    executor: BoundedExecutor,
    sink: Arc<dyn SummarySink>,
    runs: Mutex<HashMap<String, Arc<Mutex<JobRun>>>>,
}

impl JobCoordinator {
    /// Create a coordinator that dispatches subtasks through `executor`
    /// and hands completed-run summaries to `sink`.
    pub fn new(executor: BoundedExecutor, sink: Arc<dyn SummarySink>) -> Self {
        Self {
            executor,
            sink,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new run for `key`, dispatching every subtask concurrently.
    ///
    /// Rejected with [`CoreError::AlreadyRunning`] if a run for this key
    /// is still in flight; the existing run is left untouched.
    pub async fn start(
        self: &Arc<Self>,
        key: &str,
        fingerprint: &str,
        subtasks: Vec<Arc<dyn Subtask>>,
    ) -> Result<Uuid> {
        let cell = {
            let mut runs = self.runs.lock().unwrap();

            if let Some(existing) = runs.get(key) {
                if existing.lock().unwrap().status == JobStatus::Running {
                    return Err(CoreError::AlreadyRunning {
                        key: key.to_string(),
                    });
                }
            }

            let run = JobRun {
                id: Uuid::new_v4(),
                status: JobStatus::Running,
                key: key.to_string(),
                fingerprint: fingerprint.to_string(),
                start_time: Utc::now(),
                finish_time: None,
                progress: subtasks
                    .iter()
                    .map(|s| (s.name().to_string(), SubtaskStatus::Running))
                    .collect(),
                results: BTreeMap::new(),
                error: None,
                summary_sent: false,
            };
            let cell = Arc::new(Mutex::new(run));
            runs.insert(key.to_string(), Arc::clone(&cell));
            cell
        };

        let run_id = cell.lock().unwrap().id;
        info!(key, run_id = %run_id, subtasks = subtasks.len(), "job run started");

        // A run with no subtasks is vacuously complete.
        if subtasks.is_empty() {
            if let Some(summary) = cell.lock().unwrap().try_finish() {
                self.sink.persist(summary).await;
            }
            return Ok(run_id);
        }

        for subtask in subtasks {
            let coord = Arc::clone(self);
            let key = key.to_string();
            tokio::spawn(async move {
                let name = subtask.name().to_string();
                let op_key = key.clone();
                let outcome = coord
                    .executor
                    .execute(async move { subtask.run(&op_key).await })
                    .await;

                let (status, payload) = match outcome {
                    Ok(Outcome::Ok(text)) => (SubtaskStatus::Done, Value::String(text)),
                    Ok(Outcome::Failed(reason)) => (SubtaskStatus::Error, Value::String(reason)),
                    Err(err @ CoreError::Timeout { .. }) => (
                        SubtaskStatus::Timeout,
                        json!({ "message": err.to_string() }),
                    ),
                    Err(err) => (SubtaskStatus::Error, json!({ "message": err.to_string() })),
                };

                if let Err(err) = coord.update(&key, &name, status, Some(payload)).await {
                    warn!(key, subtask = %name, error = %err, "failed to record subtask outcome");
                }
            });
        }

        Ok(run_id)
    }

    /// Record a subtask's status (and optional result) for a run.
    ///
    /// When the last subtask reaches a terminal status, the aggregate
    /// transition happens here and the run's summary is persisted.
    pub async fn update(
        &self,
        key: &str,
        subtask: &str,
        status: SubtaskStatus,
        result: Option<Value>,
    ) -> Result<()> {
        let cell = self
            .runs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::JobNotFound(key.to_string()))?;

        let summary = {
            let mut run = cell.lock().unwrap();
            run.progress.insert(subtask.to_string(), status);
            if let Some(value) = result {
                run.results.insert(subtask.to_string(), value);
            }
            debug!(key, subtask, status = ?status, "subtask reported");
            run.try_finish()
        };

        // Persist outside the run lock; the summary_sent flag guarantees
        // this happens at most once per run.
        if let Some(summary) = summary {
            info!(key, "job run finished, persisting summary");
            self.sink.persist(summary).await;
        }

        Ok(())
    }

    /// Snapshot the run for `key`.
    pub fn status(&self, key: &str) -> Result<JobSnapshot> {
        let cell = self
            .runs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::JobNotFound(key.to_string()))?;
        let run = cell.lock().unwrap();
        Ok(run.snapshot())
    }
}
