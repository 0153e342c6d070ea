//! Error types for cmdwire plumbing.
//!
//! [`WireError`] is internal to the transports, the server and the framing layer.
//! It never reaches a caller of [`Client`](crate::Client): transports turn it into a
//! failure [`ResultEnvelope`](crate::ResultEnvelope) before handing a result back.

use thiserror::Error;

/// Main error type for all wire-level operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket or channel operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed frame, unexpected message shape, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake was rejected or never completed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Configuration could not be loaded or is inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<toml::de::Error> for WireError {
    fn from(err: toml::de::Error) -> Self {
        WireError::Config(err.to_string())
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
