//! Error taxonomy for the sync engine.
//!
//! Nothing here is fatal: every variant is either logged and swallowed
//! (transient I/O, invalid payloads) or recoverable by reconnecting.

use constellation_env::EnvError;
use thiserror::Error;
use crate::sync_channel::ConnectionState;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Publish/upsert/read failure; retried implicitly on the next heartbeat
    #[error("Transient I/O failure: {0}")]
    TransientIo(#[from] EnvError),

    /// Malformed remote event or out-of-range coordinates
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Transport connection dropped; local view is cleared
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation not permitted in the current connection state
    #[error("Invalid state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: ConnectionState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session has been disposed or its queue is gone
    #[error("Session closed")]
    SessionClosed,
}

impl SyncError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}
