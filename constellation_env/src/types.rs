//! Common types for the Constellation environment abstraction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a participant (a device, remote peer, or bot).
///
/// Stable and globally unique. Random ids use UUID v4 for uniqueness
/// without coordination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a new random ParticipantId.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing id string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a deterministic ParticipantId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Health of the underlying transport connection, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// Connection (re)established
    Connected,

    /// Connection alive but failing intermittently
    Degraded(String),

    /// Connection lost; subscriptions are gone
    Closed(String),
}

/// An inbound event delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A named broadcast with an untyped JSON payload
    Broadcast { event: String, payload: Value },

    /// A member joined the channel's presence set
    PresenceJoin(ParticipantId),

    /// A member left the channel's presence set
    PresenceLeave(ParticipantId),

    /// Connection status change
    Status(TransportStatus),
}

/// Callback invoked for every event on a subscription.
pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Handle returned by `PubSubChannel::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Backend-assigned subscription id
    pub id: u64,

    /// Channel name
    pub channel: String,

    /// Presence key this subscription joined with
    pub member: ParticipantId,
}
