//! Error types for the realtime layer.

use thiserror::Error;

/// Errors produced by the realtime collaboration layer.
///
/// Most of these never reach UI-level callers: transport failures are turned
/// into reconnect decisions inside the event channel, and exhaustion is
/// reported as a [`ConnectionStatus`](crate::ConnectionStatus) instead.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The transport could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A frame could not be written to the transport.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The transport was closed.
    #[error("Connection closed")]
    Closed,

    /// A frame did not follow the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A replicated-structure update could not be decoded or applied.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RealtimeError>;
