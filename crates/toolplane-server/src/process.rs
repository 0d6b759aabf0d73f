//! Client for an external tool process speaking newline-delimited
//! JSON-RPC over its stdin/stdout.
//!
//! A background reader task drains the child's stdout and delivers each
//! response to the pending request with the matching id, so concurrent
//! requests multiplex over the single pipe. A per-request timeout keeps
//! a silent child from wedging the caller.
//!
//! Known limitation: abandoning a timed-out request stops our wait, not
//! the child's work. A later response for that id is logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use toolplane_types::{
    CallToolResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ProcessSpec,
    ToolDescriptor, PROTOCOL_VERSION,
};

use crate::error::{Result, ServerError};

/// Pending response registry: request id -> oneshot sender.
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// How long to wait for any single response from the child.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A running external tool process.
pub struct ProcessClient {
    name: String,
    // Held so kill_on_drop fires when the client goes away.
    #[allow(dead_code)]
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<tokio::process::ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    #[allow(dead_code)]
    reader_handle: Arc<tokio::task::JoinHandle<()>>,
}

impl ProcessClient {
    /// Spawn the process described by `spec` and complete the
    /// `initialize` handshake.
    pub async fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServerError::Transport("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::Transport("failed to capture stdout".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        // Background reader: route response lines to their pending
        // oneshot by id, skip anything else the child prints.
        let reader_pending = Arc::clone(&pending);
        let server_name = spec.name.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(server = %server_name, "child closed stdout");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(response) => {
                                let id = response.id;
                                let mut map = reader_pending.lock().await;
                                if let Some(tx) = map.remove(&id) {
                                    let _ = tx.send(response);
                                } else {
                                    warn!(
                                        server = %server_name,
                                        id,
                                        "response with no pending request, dropping"
                                    );
                                }
                            }
                            Err(e) => {
                                debug!(server = %server_name, error = %e, "ignoring non-response line");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(server = %server_name, error = %e, "read error, reader exiting");
                        break;
                    }
                }
            }

            // Wake every waiter; their oneshot senders are gone now.
            reader_pending.lock().await.clear();
        });

        let client = Self {
            name: spec.name.clone(),
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            reader_handle: Arc::new(reader_handle),
        };

        client.handshake().await?;
        info!(server = %client.name, command = %spec.command, "external tool process ready");
        Ok(client)
    }

    /// Server name from the launch spec.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `initialize` request plus `notifications/initialized`.
    async fn handshake(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolplane",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let response = self.send_request("initialize", params).await?;
        if let Some(err) = response.error {
            return Err(ServerError::Protocol(format!(
                "initialize rejected by {}: {}",
                self.name, err.message
            )));
        }
        self.send_notification("notifications/initialized", json!({}))
            .await
    }

    /// List the tools the child advertises.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let response = self.send_request("tools/list", json!({})).await?;
        let result = expect_result(&self.name, response)?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| ServerError::Protocol(format!("{}: tools/list had no tools", self.name)))?;
        Ok(serde_json::from_value(tools)?)
    }

    /// Call a tool on the child, by its un-prefixed name.
    pub async fn call_tool(&self, tool: &str, args: Value) -> Result<CallToolResult> {
        let params = json!({ "name": tool, "arguments": args });
        let response = self.send_request("tools/call", params).await?;
        let result = expect_result(&self.name, response)?;
        Ok(serde_json::from_value(result)?)
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        debug!(server = %self.name, method, id, "sending request");

        let (tx, rx) = oneshot::channel::<JsonRpcResponse>();
        {
            let mut map = self.pending.lock().await;
            map.insert(id, tx);
        }

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ServerError::Transport(format!("write to stdin failed: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| ServerError::Transport(format!("flush of stdin failed: {e}")))?;
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ServerError::Transport(format!(
                "{} closed stdout before responding",
                self.name
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ServerError::Transport(format!(
                    "request {id} to {} timed out after {}s",
                    self.name,
                    REQUEST_TIMEOUT.as_secs()
                )))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let mut line = serde_json::to_string(&notif)?;
        line.push('\n');

        debug!(server = %self.name, method, "sending notification");

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ServerError::Transport(format!("write to stdin failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ServerError::Transport(format!("flush of stdin failed: {e}")))?;
        Ok(())
    }
}

/// Unwrap a response into its `result`, turning a JSON-RPC error into a
/// typed protocol error.
fn expect_result(server: &str, response: JsonRpcResponse) -> Result<Value> {
    if let Some(err) = response.error {
        return Err(ServerError::Protocol(format!(
            "{server} returned error {}: {}",
            err.code, err.message
        )));
    }
    response
        .result
        .ok_or_else(|| ServerError::Protocol(format!("{server}: response had neither result nor error")))
}
