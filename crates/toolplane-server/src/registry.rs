//! Tool registry and owner resolution.
//!
//! Internal tools are served in-process. External tools live behind a
//! child process and are namespaced as `server__tool`, so the owning
//! server can be resolved from the name alone even before the process
//! has been started. An external server stays [`ToolOwner::Lazy`] until
//! its first call (or autostart) promotes it to [`ToolOwner::Running`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use toolplane_types::{ProcessSpec, ToolDescriptor};

use crate::error::Result;
use crate::process::ProcessClient;
use crate::tool::Tool;

/// Separator between a server name and its tool names.
pub const NAMESPACE_SEP: &str = "__";

/// Who serves a given tool name.
pub enum ToolOwner {
    /// No internal tool or configured server matches.
    NotFound,
    /// Served in-process.
    Internal(Arc<dyn Tool>),
    /// Served by an already running external process.
    Running(Arc<ProcessClient>),
    /// Served by a configured external process that has not been
    /// started yet.
    Lazy(ProcessSpec),
}

/// Registry of internal tools and configured external servers.
pub struct ToolRegistry {
    internal: Vec<Arc<dyn Tool>>,
    external: Vec<ProcessSpec>,
    running: RwLock<HashMap<String, Arc<ProcessClient>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            internal: Vec::new(),
            external: Vec::new(),
            running: RwLock::new(HashMap::new()),
        }
    }

    /// Register an internal tool. Listing order follows registration
    /// order.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.internal.push(tool);
    }

    /// Add an external server spec. Listing order follows config order.
    pub fn add_external(&mut self, spec: ProcessSpec) {
        self.external.push(spec);
    }

    /// Start every server marked `autostart`. A spawn failure is logged
    /// and skipped; the server stays lazy and may succeed on first call.
    pub async fn autostart(&self) {
        for spec in &self.external {
            if !spec.autostart {
                continue;
            }
            if let Err(e) = self.ensure_running(spec).await {
                warn!(server = %spec.name, error = %e, "autostart failed, leaving server lazy");
            }
        }
    }

    /// Resolve the owner for a tool name.
    ///
    /// Internal tools match exactly. External tools match by their
    /// `server__` prefix, which is how a not-yet-started server can own
    /// a name without having advertised it.
    pub fn resolve(&self, name: &str) -> ToolOwner {
        if let Some(tool) = self.internal.iter().find(|t| t.name() == name) {
            return ToolOwner::Internal(Arc::clone(tool));
        }

        if let Some((server, _tool)) = name.split_once(NAMESPACE_SEP) {
            if let Some(client) = self.running.read().unwrap().get(server) {
                return ToolOwner::Running(Arc::clone(client));
            }
            if let Some(spec) = self.external.iter().find(|s| s.name == server) {
                debug!(server, tool = name, "resolved to lazy server");
                return ToolOwner::Lazy(spec.clone());
            }
        }

        ToolOwner::NotFound
    }

    /// Spawn the server if needed and return its client.
    pub async fn ensure_running(&self, spec: &ProcessSpec) -> Result<Arc<ProcessClient>> {
        if let Some(client) = self.running.read().unwrap().get(&spec.name) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(ProcessClient::spawn(spec).await?);
        info!(server = %spec.name, "external server promoted to running");

        let mut map = self.running.write().unwrap();
        // A concurrent caller may have won the spawn; keep theirs.
        Ok(Arc::clone(
            map.entry(spec.name.clone()).or_insert(client),
        ))
    }

    /// Every advertised tool: internal tools in registration order,
    /// then each running server's tools (namespaced) in config order.
    ///
    /// Lazy servers that have never been started advertise nothing;
    /// their tools become visible once a call or autostart spawns them.
    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> =
            self.internal.iter().map(|t| t.descriptor()).collect();

        for spec in &self.external {
            let client = {
                let map = self.running.read().unwrap();
                map.get(&spec.name).cloned()
            };
            let Some(client) = client else { continue };

            match client.list_tools().await {
                Ok(remote) => {
                    tools.extend(remote.into_iter().map(|mut t| {
                        t.name = format!("{}{}{}", spec.name, NAMESPACE_SEP, t.name);
                        t
                    }));
                }
                Err(e) => {
                    warn!(server = %spec.name, error = %e, "tools/list failed, omitting its tools");
                }
            }
        }

        tools
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
