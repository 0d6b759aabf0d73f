//! Configuration schema for the toolplane process.
//!
//! Loaded from `toolplane.toml` by the CLI; every section and field has
//! a default so an absent or empty file yields a working configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server identity reported in the `initialize` handshake.
    pub server: ServerInfoConfig,
    /// Bounded executor settings.
    pub executor: ExecutorSettings,
    /// Default circuit breaker thresholds.
    pub breaker: BreakerSettings,
    /// External tool processes, keyed by server name.
    pub external: Vec<ProcessSpec>,
}

/// Server identity (`serverInfo` in the handshake response).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfoConfig {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl Default for ServerInfoConfig {
    fn default() -> Self {
        Self {
            name: "toolplane".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Bounded executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Wall-clock budget for a single tool call, in seconds.
    pub budget_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { budget_secs: 30 }
    }
}

/// Default circuit breaker thresholds.
///
/// Applied to any breaker that is not configured explicitly; breakers
/// are created lazily on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures required to trip a closed breaker open.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before probing recovery.
    pub reset_timeout_secs: u64,
    /// Successes required while half-open to close again.
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

/// Launch spec for an external tool process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Server name (unique identifier, also the breaker name).
    pub name: String,
    /// Command to spawn the server.
    pub command: String,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Spawn at startup instead of on first call.
    #[serde(default)]
    pub autostart: bool,
}
