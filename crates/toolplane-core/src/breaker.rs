//! Named circuit breakers with lazy, read-time state evaluation.
//!
//! Each breaker is an independent closed/open/half-open state machine
//! keyed by name. The registry creates breakers lazily on first
//! reference, so an unknown name always reads as closed (fail open
//! toward availability).
//!
//! The open -> half-open transition happens at read time: when the
//! state is next queried after `reset_timeout` has elapsed, the
//! observed phase becomes half-open. There is no background timer, so
//! an idle breaker can report `open` past its reset timeout until
//! someone asks. That latency is a deliberate trade-off, not a bug.
//!
//! Locking follows the keyed-map shape used elsewhere in this
//! workspace: an outer `RwLock<HashMap>` of independently locked
//! entries, so distinct names never block each other. The per-breaker
//! mutex is never held across the protected operation's await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Failures required to trip a closed breaker open.
    pub failure_threshold: u32,
    /// How long an open breaker waits before probing recovery.
    pub reset_timeout: Duration,
    /// Successes required while half-open to fully close.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl From<&toolplane_types::BreakerSettings> for BreakerConfig {
    fn from(settings: &toolplane_types::BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_secs(settings.reset_timeout_secs),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }
}

/// Observable phase of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    /// Calls pass through; failures accumulate.
    Closed,
    /// Calls fail fast without touching the collaborator.
    Open,
    /// A limited number of probe calls are allowed through.
    HalfOpen,
}

/// Point-in-time view of one breaker, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Observed phase at snapshot time.
    pub phase: BreakerPhase,
    /// Current failure count.
    pub failure_count: u32,
    /// Current half-open success count.
    pub success_count: u32,
}

/// Per-name breaker state. Mutated only under its own mutex.
struct BreakerState {
    phase: BreakerPhase,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    config: BreakerConfig,
}

impl BreakerState {
    fn new(config: BreakerConfig) -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            config,
        }
    }

    /// Evaluate the phase as observed at `now`, applying the lazy
    /// open -> half-open transition.
    fn observed_phase(&mut self, now: Instant) -> BreakerPhase {
        if self.phase == BreakerPhase::Open {
            if let Some(failed_at) = self.last_failure_time {
                if now.duration_since(failed_at) >= self.config.reset_timeout {
                    self.phase = BreakerPhase::HalfOpen;
                    self.success_count = 0;
                }
            }
        }
        self.phase
    }

    fn record_success(&mut self) {
        match self.phase {
            BreakerPhase::Closed => {
                // Decaying counter, not a consecutive-failure streak.
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            BreakerPhase::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.half_open_max_calls {
                    self.phase = BreakerPhase::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            BreakerPhase::Open => {}
        }
    }

    fn record_failure(&mut self, now: Instant) {
        match self.phase {
            BreakerPhase::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.phase = BreakerPhase::Open;
                    self.last_failure_time = Some(now);
                }
            }
            BreakerPhase::HalfOpen => {
                self.phase = BreakerPhase::Open;
                self.last_failure_time = Some(now);
                self.success_count = 0;
            }
            BreakerPhase::Open => {
                self.last_failure_time = Some(now);
            }
        }
    }
}

/// Registry of named breakers, created lazily with default thresholds.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerState>>>>,
    defaults: BreakerConfig,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    /// Create a registry whose lazily created breakers use `defaults`.
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Pre-configure a breaker with explicit thresholds.
    ///
    /// Replaces any existing state for the name.
    pub fn configure(&self, name: &str, config: BreakerConfig) {
        let mut map = self.breakers.write().unwrap();
        map.insert(
            name.to_string(),
            Arc::new(Mutex::new(BreakerState::new(config))),
        );
    }

    /// Observed phase of the named breaker.
    ///
    /// Unknown names are created on the spot and therefore read as
    /// closed, never as an error.
    pub fn phase(&self, name: &str) -> BreakerPhase {
        let cell = self.entry(name);
        let mut state = cell.lock().unwrap();
        state.observed_phase(Instant::now())
    }

    /// Snapshot every known breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let map = self.breakers.read().unwrap();
        let mut out: Vec<BreakerSnapshot> = map
            .iter()
            .map(|(name, cell)| {
                let mut state = cell.lock().unwrap();
                BreakerSnapshot {
                    name: name.clone(),
                    phase: state.observed_phase(now),
                    failure_count: state.failure_count,
                    success_count: state.success_count,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Run `op` under the named breaker.
    ///
    /// If the breaker is open the call fails fast with
    /// [`CoreError::BreakerOpen`] and `op` is never polled. Otherwise
    /// the outcome is recorded (an `Err` counts as a failure, an `Ok`
    /// as a success) and propagated to the caller unchanged.
    pub async fn call<T, E, F>(&self, name: &str, op: F) -> Result<std::result::Result<T, E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let cell = self.entry(name);

        let phase = {
            let mut state = cell.lock().unwrap();
            state.observed_phase(Instant::now())
        };
        if phase == BreakerPhase::Open {
            debug!(breaker = name, "rejecting call, breaker open");
            return Err(CoreError::BreakerOpen {
                name: name.to_string(),
            });
        }

        let outcome = op.await;

        {
            let mut state = cell.lock().unwrap();
            match outcome {
                Ok(_) => state.record_success(),
                Err(_) => {
                    state.record_failure(Instant::now());
                    if state.phase == BreakerPhase::Open {
                        warn!(
                            breaker = name,
                            failures = state.failure_count,
                            "breaker tripped open"
                        );
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Get or lazily create the named breaker cell.
    fn entry(&self, name: &str) -> Arc<Mutex<BreakerState>> {
        {
            let map = self.breakers.read().unwrap();
            if let Some(cell) = map.get(name) {
                return Arc::clone(cell);
            }
        }
        let mut map = self.breakers.write().unwrap();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new(self.defaults)))),
        )
    }
}
