//! Participant model and the position-update wire format.

use constellation_env::ParticipantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::SyncError;
use crate::geomath::GeoPoint;

// ============================================================================
// COLOR
// ============================================================================

/// Opaque visual tag for a participant, rendered as `#rrggbb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(String);

impl Color {
    /// Derives a stable color from the participant id (FNV-1a, low 24 bits).
    pub fn from_id(id: &ParticipantId) -> Self {
        let mut hash: u32 = 0x811c9dc5;
        for byte in id.as_str().bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x01000193);
        }
        Self(format!("#{:06x}", hash & 0x00ff_ffff))
    }

    /// Wraps a color string received from the durable store.
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// PARTICIPANT
// ============================================================================

/// An entity (device, remote peer or bot) tracked by the `PositionStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub color: Color,

    /// Absent until the first position arrives (e.g. presence-only join)
    pub position: Option<GeoPoint>,

    /// Unix milliseconds of the newest accepted update
    pub last_seen: u64,

    pub online: bool,
}

impl Participant {
    /// Creates an online participant without a position.
    pub fn new(id: ParticipantId, last_seen: u64) -> Self {
        let color = Color::from_id(&id);
        Self {
            id,
            color,
            position: None,
            last_seen,
            online: true,
        }
    }

    pub fn with_position(mut self, position: GeoPoint) -> Self {
        self.position = Some(position);
        self
    }

    /// True when the participant can take part in the proximity graph.
    pub fn is_placeable(&self) -> bool {
        self.online && self.position.is_some()
    }
}

// ============================================================================
// NETWORK MESSAGE
// ============================================================================

/// Broadcast event name for position updates.
pub const LOCATION_EVENT: &str = "location";

/// The wire format broadcast on the channel: one participant's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub participant_id: ParticipantId,
    pub lat: f64,
    pub lng: f64,

    /// Sender's wall clock, Unix milliseconds
    pub timestamp: u64,

    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl PositionUpdate {
    pub fn new(participant_id: ParticipantId, position: GeoPoint, timestamp: u64) -> Self {
        Self {
            participant_id,
            lat: position.lat,
            lng: position.lng,
            timestamp,
            online: true,
        }
    }

    /// A departure announcement carrying the last known position.
    pub fn offline(participant_id: ParticipantId, position: GeoPoint, timestamp: u64) -> Self {
        Self {
            online: false,
            ..Self::new(participant_id, position, timestamp)
        }
    }

    /// Validated position carried by this update.
    pub fn position(&self) -> Result<GeoPoint, SyncError> {
        GeoPoint::new(self.lat, self.lng)
    }

    /// Parses and validates a broadcast payload.
    pub fn from_payload(payload: &Value) -> Result<Self, SyncError> {
        let update: PositionUpdate = serde_json::from_value(payload.clone())
            .map_err(|e| SyncError::invalid_payload(format!("malformed location event: {}", e)))?;
        if update.participant_id.as_str().is_empty() {
            return Err(SyncError::invalid_payload("empty participant id"));
        }
        update.position()?;
        Ok(update)
    }

    pub fn to_payload(&self) -> Value {
        // Serializing a plain struct of numbers and strings cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
