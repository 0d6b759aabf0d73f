//! Internal tool trait and the builtin capabilities.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use toolplane_core::BreakerRegistry;
use toolplane_types::{ServerInfoConfig, ToolDescriptor};

/// A capability served directly by this process.
///
/// `execute` returns either a result payload or an explicit failure
/// reason. Timeouts and panics are the caller's concern; the tool only
/// reports its own outcome.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as advertised to the client.
    fn name(&self) -> &str;

    /// One-line description.
    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    /// Run the tool.
    async fn execute(&self, args: Value) -> std::result::Result<Value, String>;

    /// Wire-facing descriptor for `tools/list`.
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Echoes its `text` argument back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back to the caller"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> std::result::Result<Value, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required argument: text".to_string())?;
        Ok(Value::String(text.to_string()))
    }
}

/// Reports server identity and the current breaker states.
pub struct StatusTool {
    info: ServerInfoConfig,
    breakers: Arc<BreakerRegistry>,
}

impl StatusTool {
    pub fn new(info: ServerInfoConfig, breakers: Arc<BreakerRegistry>) -> Self {
        Self { info, breakers }
    }
}

#[async_trait]
impl Tool for StatusTool {
    fn name(&self) -> &str {
        "status"
    }

    fn description(&self) -> &str {
        "Report server identity and circuit breaker states"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value) -> std::result::Result<Value, String> {
        let breakers = self.breakers.snapshot();
        Ok(json!({
            "server": self.info.name,
            "version": self.info.version,
            "breakers": breakers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_text() {
        let result = EchoTool.execute(json!({ "text": "hello" })).await.unwrap();
        assert_eq!(result, json!("hello"));
    }

    #[tokio::test]
    async fn echo_without_text_is_an_explicit_failure() {
        let err = EchoTool.execute(json!({})).await.unwrap_err();
        assert!(err.contains("text"));
    }

    #[tokio::test]
    async fn status_reports_identity_and_breakers() {
        let breakers = Arc::new(BreakerRegistry::default());
        breakers.phase("search");
        let tool = StatusTool::new(ServerInfoConfig::default(), breakers);

        let result = tool.execute(json!({})).await.unwrap();
        assert_eq!(result["server"], "toolplane");
        assert_eq!(result["breakers"][0]["name"], "search");
        assert_eq!(result["breakers"][0]["phase"], "closed");
    }

    #[test]
    fn descriptor_carries_schema() {
        let desc = EchoTool.descriptor();
        assert_eq!(desc.name, "echo");
        assert_eq!(desc.input_schema["required"][0], "text");
    }
}
