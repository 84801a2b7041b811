//! Common error types for stratumd.
//!
//! This module provides a centralized Error enum using thiserror, plus the
//! JSON-RPC error type used for stratum wire replies. Handler failures are
//! typed `RpcError` values; constructing the wire reply from one is a pure
//! function of (code, message, id) in the rpc module.

use thiserror::Error;

/// Main error type for stratumd operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Errors reported by the backing node
    #[error("Node error: {0}")]
    Node(String),

    /// Merge-mining subsystem errors
    #[error("Merge-mining error: {0}")]
    MergeMine(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A JSON-RPC protocol error, carried back to the miner in the `error`
/// member of a reply.
///
/// The numeric codes follow the bitcoind RPC error space so that stratum
/// proxies written against it keep working: -32700/-32601/-32603 are the
/// standard JSON-RPC codes, -8 is invalid-parameter, -9/-10 are the
/// node-state codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self { code: -32700, message: message.into() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self { code: -32600, message: message.into() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self { code: -32601, message: format!("Method '{}' not found", method) }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { code: -32603, message: message.into() }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self { code: -8, message: message.into() }
    }

    pub fn client_not_connected(message: impl Into<String>) -> Self {
        Self { code: -9, message: message.into() }
    }

    pub fn in_initial_download(message: impl Into<String>) -> Self {
        Self { code: -10, message: message.into() }
    }
}
