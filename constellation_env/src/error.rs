//! Error types for the Constellation environment abstraction.

use thiserror::Error;

/// Errors that can occur at the I/O boundary (transport, durable store, runtime).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvError {
    /// Publish/subscribe failed (buffer full, connection refused, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The channel or subscription is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Durable store read/write failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Payload or record serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageError(msg.into())
    }

    /// Creates a closed-channel error.
    pub fn closed(channel: impl std::fmt::Display) -> Self {
        Self::ChannelClosed(channel.to_string())
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
