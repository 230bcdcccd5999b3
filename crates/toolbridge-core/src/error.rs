//! Crate-wide error types
//!
//! Invocation-level failures are collected in [`BridgeError`]. Tool-level
//! failures (unknown tool, a tool returning an error, a tool panicking) are not
//! errors at this level: they travel back to the caller as a
//! [`ToolResult`](crate::protocol::ToolResult) with `success = false`.

use std::time::Duration;
use thiserror::Error;

use crate::correlation::CorrelationError;
use crate::transport::TransportError;

/// Errors surfaced by handler, router and configuration operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed call (empty tool name, unknown application, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connect, send or receive failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The caller's deadline elapsed before a response arrived
    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired
    #[error("Invocation cancelled")]
    Cancelled,

    /// The connection carrying the invocation went away
    #[error("Connection lost")]
    ConnectionLost,

    /// Pending-request bookkeeping failure
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Envelope could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid handler or router configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<BridgeError> for String {
    fn from(err: BridgeError) -> String {
        err.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BridgeError>;
