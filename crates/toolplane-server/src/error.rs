//! Error types for the server crate.

use thiserror::Error;

/// Errors raised by the dispatcher, registry, and process transport.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O failure on the protocol stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure talking to an external tool process.
    #[error("transport error: {0}")]
    Transport(String),

    /// A peer violated the protocol contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, ServerError>;
