//! Shared types for the toolplane control plane.
//!
//! Contains the JSON-RPC 2.0 wire types, tool descriptors and call
//! results, and the configuration schema. No I/O happens here; the
//! serving loop lives in `toolplane-server` and the resilience
//! primitives in `toolplane-core`.

pub mod config;
pub mod rpc;
pub mod tool;

pub use config::{BreakerSettings, Config, ExecutorSettings, ProcessSpec, ServerInfoConfig};
pub use rpc::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
pub use tool::{CallToolResult, ContentBlock, ToolDescriptor};

/// The MCP protocol version spoken during the `initialize` handshake.
///
/// Single source of truth for both the serving loop and the external
/// process client.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
