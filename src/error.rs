//! Error types for the bridge
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling. The variants mirror the
//! error taxonomy of the dispatcher: each kind carries a fixed HTTP status
//! and, where it surfaces inside a JSON-RPC envelope, a fixed error code.

use thiserror::Error;

/// Main error type for bridge operations
///
/// This enum encompasses all possible errors that can occur during request
/// dispatch, subprocess management, path resolution, and configuration
/// loading.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Named server not present in the catalog
    #[error("Unknown server: {0}")]
    ServerUnknown(String),

    /// Malformed JSON-RPC request envelope
    #[error("Parse error: {0}")]
    Parse(String),

    /// Inbound path escapes the session workspace
    #[error("Path escapes workspace: {0}")]
    PathEscape(String),

    /// Session registry caps hit
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Subprocess could not be launched
    #[error("Failed to spawn server `{server}`: {message}")]
    SpawnFailed {
        /// Server identifier from the catalog
        server: String,
        /// Underlying launch failure
        message: String,
    },

    /// Adapter died while requests were pending
    #[error("Adapter terminated: {0}")]
    AdapterTerminated(String),

    /// Per-call deadline exceeded
    #[error("Request timeout: server={server}, method={method}")]
    Timeout {
        /// Server identifier
        server: String,
        /// JSON-RPC method that timed out
        method: String,
    },

    /// Transport-level I/O failure (closed channel, broken pipe)
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal runtime error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// HTTP status this error maps to at the surface.
    ///
    /// Domain errors that travel inside a JSON-RPC `error` member still
    /// return `200`; only envelope-level failures use 4xx/5xx.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::ServerUnknown(_) => 404,
            BridgeError::Parse(_) => 400,
            BridgeError::CapacityExceeded(_) => 503,
            BridgeError::Timeout { .. } => 504,
            _ => 200,
        }
    }

    /// JSON-RPC error code used when this error is embedded in a response.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            BridgeError::Parse(_) => crate::rpc::PARSE_ERROR,
            BridgeError::ServerUnknown(_) => crate::rpc::METHOD_NOT_FOUND,
            BridgeError::PathEscape(_) => crate::rpc::INVALID_PARAMS,
            BridgeError::Timeout { .. } => crate::rpc::REQUEST_TIMEOUT,
            BridgeError::AdapterTerminated(_) => crate::rpc::ADAPTER_TERMINATED,
            _ => crate::rpc::INTERNAL_ERROR,
        }
    }
}

/// Result type alias for bridge operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation. Core dispatch
/// paths that need to match on error kinds return `BridgeError` directly.
pub type Result<T> = anyhow::Result<T>;
