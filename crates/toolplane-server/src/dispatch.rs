//! Protocol dispatcher: newline-delimited JSON-RPC over a byte stream.
//!
//! [`Dispatcher::run`] is generic over `AsyncBufRead + AsyncWrite` so it
//! can be driven by stdio in production and in-memory buffers in tests.
//! Lines are processed strictly in order: one inbound line is fully
//! handled, and its response (if any) fully written, before the next
//! read. Responses therefore come back in request order.
//!
//! A fault while handling one request is answered with an internal
//! error and the loop continues; only EOF, a read failure, or
//! cancellation ends the session.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolplane_core::{BoundedExecutor, BreakerRegistry, CoreError, Outcome};
use toolplane_types::{
    CallToolResult, ServerInfoConfig, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR, PROTOCOL_VERSION,
};

use crate::error::Result;
use crate::process::ProcessClient;
use crate::registry::{ToolOwner, ToolRegistry, NAMESPACE_SEP};

/// Reply produced by handling one request.
enum Reply {
    Result(Value),
    Error(i32, String),
}

/// How an external call went wrong, before it becomes a reply.
///
/// An explicit tool failure travels back as an `isError` result; any
/// other fault becomes an internal error. Both count as failures for
/// the server's breaker.
enum CallFailure {
    Tool(String),
    Fault(String),
}

/// The serving loop: routes inbound requests to the registry's tools
/// through the breaker registry and the bounded executor.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    breakers: Arc<BreakerRegistry>,
    executor: BoundedExecutor,
    info: ServerInfoConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        breakers: Arc<BreakerRegistry>,
        executor: BoundedExecutor,
        info: ServerInfoConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            executor,
            info,
        }
    }

    /// Run until EOF, a read failure, or cancellation.
    pub async fn run<R, W>(
        &self,
        reader: R,
        mut writer: W,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher cancelled, shutting down");
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(line) => line,
                    // A broken transport ends the session the same way
                    // EOF does; only write faults surface as errors.
                    Err(e) => {
                        info!(error = %e, "input stream failed, shutting down");
                        break;
                    }
                },
            };
            let Some(line) = line else {
                debug!("input stream closed, shutting down");
                break;
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            // Junk that is not JSON at all gets a parse error and the
            // session stays alive.
            let msg: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "unparseable input line");
                    let resp = error_response(Value::Null, PARSE_ERROR, "Parse error");
                    write_line(&mut writer, &resp).await?;
                    continue;
                }
            };

            let Some(method) = msg.get("method").and_then(|v| v.as_str()).map(str::to_string)
            else {
                let resp = error_response(Value::Null, INVALID_REQUEST, "Invalid Request");
                write_line(&mut writer, &resp).await?;
                continue;
            };

            let id = msg.get("id").cloned().filter(|v| !v.is_null());
            let params = msg
                .get("params")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));

            let reply = self.handle(&method, params).await;

            // A message without an id is a notification; whatever it
            // asked for, it never gets a response.
            if let Some(id) = id {
                let resp = match reply {
                    Some(Reply::Result(result)) => success_response(id, result),
                    Some(Reply::Error(code, message)) => error_response(id, code, &message),
                    None => continue,
                };
                write_line(&mut writer, &resp).await?;
            }
        }

        Ok(())
    }

    /// Route one request. `None` means the method is handled purely as
    /// a notification and has no reply even when an id is present.
    async fn handle(&self, method: &str, params: Value) -> Option<Reply> {
        match method {
            "initialize" => Some(Reply::Result(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": true }
                },
                "serverInfo": {
                    "name": self.info.name,
                    "version": self.info.version,
                }
            }))),

            "notifications/initialized" => None,

            "tools/list" => {
                let tools = self.registry.list_all_tools().await;
                Some(Reply::Result(json!({ "tools": tools })))
            }

            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let args = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                Some(self.call_tool(&name, args).await)
            }

            _ => Some(Reply::Error(
                METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            )),
        }
    }

    async fn call_tool(&self, name: &str, args: Value) -> Reply {
        debug!(tool = name, "tools/call");

        match self.registry.resolve(name) {
            ToolOwner::NotFound => {
                let known: Vec<String> = self
                    .registry
                    .list_all_tools()
                    .await
                    .into_iter()
                    .map(|t| t.name)
                    .collect();
                Reply::Error(
                    INTERNAL_ERROR,
                    format!("Unknown tool: {name}. Available: [{}]", known.join(", ")),
                )
            }

            ToolOwner::Internal(tool) => {
                let outcome = self.executor.execute(async move { tool.execute(args).await }).await;
                match outcome {
                    Ok(Outcome::Ok(text)) => result_reply(CallToolResult::text(text)),
                    Ok(Outcome::Failed(reason)) => result_reply(CallToolResult::error(reason)),
                    Err(e) => Reply::Error(INTERNAL_ERROR, e.to_string()),
                }
            }

            ToolOwner::Running(client) => self.call_external(Some(client), name, args).await,

            // Spawning happens inside the breaker-protected call so an
            // open breaker also suppresses the spawn.
            ToolOwner::Lazy(_) => self.call_external(None, name, args).await,
        }
    }

    /// Run an external tool call under the owning server's breaker.
    ///
    /// The breaker wraps the whole attempt, so spawn failures and
    /// timeouts count against the server just like explicit failures.
    async fn call_external(
        &self,
        client: Option<Arc<ProcessClient>>,
        name: &str,
        args: Value,
    ) -> Reply {
        let Some((server, tool)) = name.split_once(NAMESPACE_SEP) else {
            return Reply::Error(INTERNAL_ERROR, format!("Unknown tool: {name}"));
        };

        let op = async {
            let client = match &client {
                Some(c) => Arc::clone(c),
                None => match self.registry.resolve(name) {
                    ToolOwner::Running(c) => c,
                    ToolOwner::Lazy(spec) => self
                        .registry
                        .ensure_running(&spec)
                        .await
                        .map_err(|e| CallFailure::Fault(e.to_string()))?,
                    _ => return Err(CallFailure::Fault(format!("Unknown tool: {name}"))),
                },
            };

            let tool = tool.to_string();
            let bounded = self
                .executor
                .execute(async move {
                    let result = client
                        .call_tool(&tool, args)
                        .await
                        .map_err(|e| e.to_string())?;
                    if result.is_error {
                        Err(result_text(&result))
                    } else {
                        Ok(Value::String(result_text(&result)))
                    }
                })
                .await;

            match bounded {
                Ok(Outcome::Ok(text)) => Ok(text),
                Ok(Outcome::Failed(reason)) => Err(CallFailure::Tool(reason)),
                Err(e) => Err(CallFailure::Fault(e.to_string())),
            }
        };

        match self.breakers.call(server, op).await {
            Err(e @ CoreError::BreakerOpen { .. }) => {
                warn!(server, tool = name, "call rejected by open breaker");
                Reply::Error(INTERNAL_ERROR, e.to_string())
            }
            Err(e) => Reply::Error(INTERNAL_ERROR, e.to_string()),
            Ok(Ok(text)) => result_reply(CallToolResult::text(text)),
            Ok(Err(CallFailure::Tool(reason))) => result_reply(CallToolResult::error(reason)),
            Ok(Err(CallFailure::Fault(message))) => Reply::Error(INTERNAL_ERROR, message),
        }
    }
}

/// Flatten a call result's text blocks into one string.
fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|block| {
            let toolplane_types::ContentBlock::Text { text } = block;
            text.as_str()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn result_reply(result: CallToolResult) -> Reply {
    Reply::Result(serde_json::to_value(&result).unwrap_or(Value::Null))
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// One atomic write per response: the full line, newline included, in a
/// single `write_all`, then a flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, response: &Value) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{EchoTool, StatusTool, Tool};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::time::Duration;
    use toolplane_core::BreakerConfig;
    use toolplane_types::ProcessSpec;

    // ── Test helpers ────────────────────────────────────────────────────

    fn request_line(id: u64, method: &str, params: Value) -> String {
        let req = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        format!("{}\n", serde_json::to_string(&req).unwrap())
    }

    fn notification_line(method: &str, params: Value) -> String {
        let req = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        format!("{}\n", serde_json::to_string(&req).unwrap())
    }

    fn parse_responses(output: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(output);
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("invalid JSON response"))
            .collect()
    }

    fn init_line(id: u64) -> String {
        request_line(
            id,
            "initialize",
            json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0.1" }
            }),
        )
    }

    fn make_dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(BreakerRegistry::default()),
            BoundedExecutor::default(),
            ServerInfoConfig::default(),
        )
    }

    async fn run_session(dispatcher: &Dispatcher, input: String) -> Vec<Value> {
        let reader = Cursor::new(input.into_bytes());
        let mut output = Vec::new();
        dispatcher
            .run(reader, &mut output, CancellationToken::new())
            .await
            .unwrap();
        parse_responses(&output)
    }

    // ── Protocol tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_handshake() {
        let dispatcher = make_dispatcher();
        let responses = run_session(&dispatcher, init_line(1)).await;

        assert_eq!(responses.len(), 1);
        let resp = &responses[0];
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert!(resp["result"]["capabilities"]["tools"].is_object());
        assert_eq!(resp["result"]["serverInfo"]["name"], "toolplane");
    }

    #[tokio::test]
    async fn malformed_json_gets_parse_error_with_null_id() {
        let dispatcher = make_dispatcher();
        let responses = run_session(&dispatcher, "this is not json\n".into()).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], PARSE_ERROR);
        assert!(responses[0]["id"].is_null());
    }

    #[tokio::test]
    async fn document_without_method_is_invalid_request() {
        let dispatcher = make_dispatcher();
        let mut input = String::from("[1,2,3]\n");
        input.push_str("{\"jsonrpc\":\"2.0\",\"id\":9}\n");
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 2);
        for resp in &responses {
            assert_eq!(resp["error"]["code"], INVALID_REQUEST);
            assert!(resp["id"].is_null());
        }
    }

    #[tokio::test]
    async fn junk_line_does_not_end_the_session() {
        let dispatcher = make_dispatcher();
        let mut input = String::from("garbage\n");
        input.push_str(&init_line(1));
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(responses[1]["id"], 1);
        assert!(responses[1]["result"].is_object());
    }

    #[tokio::test]
    async fn empty_and_whitespace_lines_are_skipped() {
        let dispatcher = make_dispatcher();
        let mut input = String::from("\n   \n\t\n");
        input.push_str(&init_line(1));
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 1);
    }

    #[tokio::test]
    async fn notifications_are_never_answered() {
        let dispatcher = make_dispatcher();
        let mut input = init_line(1);
        input.push_str(&notification_line("notifications/initialized", json!({})));
        // Even a request-shaped method without an id stays silent.
        input.push_str(&notification_line("tools/list", json!({})));
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let dispatcher = make_dispatcher();
        let responses =
            run_session(&dispatcher, request_line(7, "resources/list", json!({}))).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 7);
        assert_eq!(responses[0]["error"]["code"], METHOD_NOT_FOUND);
        assert!(responses[0]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("resources/list"));
    }

    #[tokio::test]
    async fn tools_list_returns_internal_tools_in_registration_order() {
        let mut registry = ToolRegistry::new();
        let breakers = Arc::new(BreakerRegistry::default());
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(StatusTool::new(
            ServerInfoConfig::default(),
            Arc::clone(&breakers),
        )));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            breakers,
            BoundedExecutor::default(),
            ServerInfoConfig::default(),
        );

        let responses = run_session(&dispatcher, request_line(1, "tools/list", json!({}))).await;
        let tools = responses[0]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[1]["name"], "status");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn tools_call_routes_to_internal_tool() {
        let dispatcher = make_dispatcher();
        let responses = run_session(
            &dispatcher,
            request_line(2, "tools/call", json!({
                "name": "echo",
                "arguments": { "text": "hello world" }
            })),
        )
        .await;

        let resp = &responses[0];
        assert_eq!(resp["id"], 2);
        assert_eq!(resp["result"]["content"][0]["text"], "hello world");
        assert_eq!(resp["result"]["isError"], false);
    }

    #[tokio::test]
    async fn explicit_tool_failure_becomes_error_result() {
        let dispatcher = make_dispatcher();
        let responses = run_session(
            &dispatcher,
            request_line(2, "tools/call", json!({ "name": "echo", "arguments": {} })),
        )
        .await;

        let resp = &responses[0];
        assert_eq!(resp["result"]["isError"], true);
        assert!(resp["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("text"));
    }

    #[tokio::test]
    async fn unknown_tool_lists_known_names() {
        let dispatcher = make_dispatcher();
        let responses = run_session(
            &dispatcher,
            request_line(3, "tools/call", json!({ "name": "vanish", "arguments": {} })),
        )
        .await;

        let resp = &responses[0];
        assert_eq!(resp["error"]["code"], INTERNAL_ERROR);
        let message = resp["error"]["message"].as_str().unwrap();
        assert!(message.contains("vanish"));
        assert!(message.contains("echo"));
    }

    // ── Fault containment ───────────────────────────────────────────────

    struct StuckTool;

    #[async_trait]
    impl Tool for StuckTool {
        fn name(&self) -> &str {
            "stuck"
        }
        fn description(&self) -> &str {
            "Never finishes"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value) -> std::result::Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!("never"))
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "Panics"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value) -> std::result::Result<Value, String> {
            panic!("tool blew up");
        }
    }

    fn faulty_dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(StuckTool));
        registry.register(Arc::new(PanickingTool));
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(BreakerRegistry::default()),
            BoundedExecutor::new(Duration::from_millis(50)),
            ServerInfoConfig::default(),
        )
    }

    #[tokio::test]
    async fn overrunning_tool_gets_internal_error_and_session_survives() {
        let dispatcher = faulty_dispatcher();
        let mut input = request_line(1, "tools/call", json!({ "name": "stuck", "arguments": {} }));
        input.push_str(&request_line(
            2,
            "tools/call",
            json!({ "name": "echo", "arguments": { "text": "still here" } }),
        ));
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], INTERNAL_ERROR);
        assert!(responses[0]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out"));
        assert_eq!(responses[1]["result"]["content"][0]["text"], "still here");
    }

    #[tokio::test]
    async fn panicking_tool_gets_internal_error_and_session_survives() {
        let dispatcher = faulty_dispatcher();
        let mut input =
            request_line(1, "tools/call", json!({ "name": "panicky", "arguments": {} }));
        input.push_str(&init_line(2));
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], INTERNAL_ERROR);
        assert!(responses[0]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("tool blew up"));
        assert!(responses[1]["result"].is_object());
    }

    #[tokio::test]
    async fn open_breaker_rejects_external_call_without_spawning() {
        let breakers = Arc::new(BreakerRegistry::default());
        breakers.configure(
            "kg",
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                half_open_max_calls: 3,
            },
        );
        // Trip the breaker.
        let _ = breakers
            .call::<(), _, _>("kg", async { Err("down") })
            .await;

        let mut registry = ToolRegistry::new();
        registry.add_external(ProcessSpec {
            name: "kg".into(),
            // Spawning this would fail loudly; an open breaker must
            // reject the call before any spawn is attempted.
            command: "/nonexistent/kg-server".into(),
            args: vec![],
            env: HashMap::new(),
            autostart: false,
        });

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            breakers,
            BoundedExecutor::default(),
            ServerInfoConfig::default(),
        );

        let responses = run_session(
            &dispatcher,
            request_line(1, "tools/call", json!({ "name": "kg__search", "arguments": {} })),
        )
        .await;

        let resp = &responses[0];
        assert_eq!(resp["error"]["code"], INTERNAL_ERROR);
        assert!(resp["error"]["message"].as_str().unwrap().contains("open"));
    }

    #[tokio::test]
    async fn failed_spawn_counts_against_the_breaker() {
        let breakers = Arc::new(BreakerRegistry::default());
        breakers.configure(
            "kg",
            BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
                half_open_max_calls: 3,
            },
        );

        let mut registry = ToolRegistry::new();
        registry.add_external(ProcessSpec {
            name: "kg".into(),
            command: "/nonexistent/kg-server".into(),
            args: vec![],
            env: HashMap::new(),
            autostart: false,
        });

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::clone(&breakers),
            BoundedExecutor::default(),
            ServerInfoConfig::default(),
        );

        let call = request_line(1, "tools/call", json!({ "name": "kg__search", "arguments": {} }));
        let mut input = call.clone();
        input.push_str(&call);
        input.push_str(&call);
        let responses = run_session(&dispatcher, input).await;

        assert_eq!(responses.len(), 3);
        // First two attempts fail on spawn; the third is rejected by
        // the now-open breaker.
        assert!(!responses[0]["error"]["message"].as_str().unwrap().contains("open"));
        assert!(!responses[1]["error"]["message"].as_str().unwrap().contains("open"));
        assert!(responses[2]["error"]["message"].as_str().unwrap().contains("open"));
        assert_eq!(
            breakers.phase("kg"),
            toolplane_core::BreakerPhase::Open
        );
    }

    #[tokio::test]
    async fn external_call_round_trip_through_scripted_child() {
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"kg","version":"0"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"three results"}],"isError":false}}'
"#;
        let mut registry = ToolRegistry::new();
        registry.add_external(ProcessSpec {
            name: "kg".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            autostart: false,
        });

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(BreakerRegistry::default()),
            BoundedExecutor::default(),
            ServerInfoConfig::default(),
        );

        let responses = run_session(
            &dispatcher,
            request_line(
                4,
                "tools/call",
                json!({ "name": "kg__search", "arguments": { "q": "x" } }),
            ),
        )
        .await;

        let resp = &responses[0];
        assert_eq!(resp["id"], 4);
        assert_eq!(resp["result"]["content"][0]["text"], "three results");
        assert_eq!(resp["result"]["isError"], false);
    }

    #[tokio::test]
    async fn cancellation_ends_an_idle_session() {
        let dispatcher = Arc::new(make_dispatcher());
        let cancel = CancellationToken::new();

        let (client_side, server_side) = tokio::io::duplex(1024);
        let (read_half, _write_half) = tokio::io::split(server_side);

        let run_cancel = cancel.clone();
        let run = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let reader = tokio::io::BufReader::new(read_half);
                dispatcher.run(reader, Vec::<u8>::new(), run_cancel).await
            })
        };

        // The reader is idle; only cancellation can end the loop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("dispatcher did not stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
        drop(client_side);
    }

    /// Reader whose first poll fails with a transport-level error.
    struct BrokenReader;

    impl tokio::io::AsyncRead for BrokenReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer went away",
            )))
        }
    }

    #[tokio::test]
    async fn read_fault_shuts_down_cleanly() {
        use tokio::io::AsyncReadExt;

        let dispatcher = make_dispatcher();
        let mut output = Vec::<u8>::new();

        // One good line, then the transport breaks mid-session.
        let reader = Cursor::new(init_line(1).into_bytes()).chain(BrokenReader);
        let result = dispatcher
            .run(
                tokio::io::BufReader::new(reader),
                &mut output,
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_ok());
        let responses = parse_responses(&output);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 1);
    }

    #[tokio::test]
    async fn full_session_flow() {
        let dispatcher = make_dispatcher();

        let mut input = init_line(1);
        input.push_str(&notification_line("notifications/initialized", json!({})));
        input.push_str(&request_line(2, "tools/list", json!({})));
        input.push_str(&request_line(
            3,
            "tools/call",
            json!({ "name": "echo", "arguments": { "text": "integration" } }),
        ));
        input.push_str(&request_line(4, "unknown/method", json!({})));

        let responses = run_session(&dispatcher, input).await;
        assert_eq!(responses.len(), 4);

        assert!(responses[0]["result"]["protocolVersion"].is_string());
        assert_eq!(
            responses[1]["result"]["tools"].as_array().unwrap().len(),
            1
        );
        assert_eq!(responses[2]["result"]["content"][0]["text"], "integration");
        assert_eq!(responses[3]["error"]["code"], METHOD_NOT_FOUND);

        // Responses come back in request order.
        let ids: Vec<u64> = responses
            .iter()
            .map(|r| r["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
