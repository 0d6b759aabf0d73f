//! Serving layer for toolplane: the JSON-RPC dispatcher, the tool
//! registry with lazy external servers, and the child-process client.

pub mod dispatch;
pub mod error;
pub mod process;
pub mod registry;
pub mod tool;

pub use dispatch::Dispatcher;
pub use error::{Result, ServerError};
pub use process::ProcessClient;
pub use registry::{ToolOwner, ToolRegistry, NAMESPACE_SEP};
pub use tool::{EchoTool, StatusTool, Tool};
