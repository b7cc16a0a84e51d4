//! Common error types for mujina-pool.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for mujina-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport errors talking to an upstream node
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a status outside 200..=299
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Upstream answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// No upstream host is enabled, healthy and (when required) synced
    #[error("no healthy hosts")]
    NoHealthyHosts,

    /// Timed out waiting on a peer
    #[error("timeout")]
    Timeout,

    /// Peer went away
    #[error("disconnected")]
    Disconnected,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML decoding errors
    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Chain adapter errors
    #[error("Node error: {0}")]
    Node(String),

    /// Proof-of-work backend errors
    #[error("PoW error: {0}")]
    Pow(String),

    /// Accounting collaborator errors
    #[error("Accounting error: {0}")]
    Accounting(String),

    /// Share aggregator errors
    #[error("Aggregator error: {0}")]
    Aggregator(String),
}

impl Error {
    /// Whether this failure says something about the upstream connection
    /// itself, as opposed to the request.
    ///
    /// Transport failures mark a host unhealthy and move the request on to
    /// the next host. Everything else is returned to the caller as-is.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Http(_)
                | Error::HttpStatus { .. }
                | Error::Timeout
                | Error::Disconnected
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
