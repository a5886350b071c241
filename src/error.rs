//! Error types for glasslink-core

use std::io;
use thiserror::Error;

/// Result type alias using LinkError
pub type Result<T> = std::result::Result<T, LinkError>;

/// Protocol error types
///
/// All errors that can occur in the glasses link protocol implementation.
/// Frame and chunking errors are recovered locally by the receive path;
/// transport and connection errors feed the reconnection state machine.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or truncated wire envelope
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// Invalid chunking arguments (caller contract violation)
    #[error("Invalid chunk request: {0}")]
    Chunking(String),

    /// Invalid packet format or content
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// No acknowledgment after exhausting the retry bound
    #[error("Delivery of message {0} failed after retries")]
    DeliveryFailed(u64),

    /// Bulk transfer aborted by an explicit peripheral notice
    #[error("Transfer aborted: {0}")]
    TransferAbort(String),

    /// Radio transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl LinkError {
    /// Create a Frame error
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Create a Chunking error
    pub fn chunking(msg: impl Into<String>) -> Self {
        Self::Chunking(msg.into())
    }

    /// Create an InvalidPacket error
    pub fn invalid_packet(msg: impl Into<String>) -> Self {
        Self::InvalidPacket(msg.into())
    }

    /// Create a Transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a Connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an Other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
