//! Durable row shapes for the `locations` and `users` tables.

use constellation_env::{EnvError, ParticipantId, Record};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use crate::participant::{Color, PositionUpdate};

pub const LOCATIONS_TABLE: &str = "locations";
pub const LOCATIONS_KEY: &str = "user_id";

pub const USERS_TABLE: &str = "users";
pub const USERS_KEY: &str = "id";

/// Last published position of a participant, for late joiners to bootstrap from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub user_id: ParticipantId,
    pub lat: f64,
    pub lng: f64,

    /// Unix milliseconds
    pub updated_at: u64,
}

impl LocationRecord {
    pub fn from_update(update: &PositionUpdate) -> Self {
        Self {
            user_id: update.participant_id.clone(),
            lat: update.lat,
            lng: update.lng,
            updated_at: update.timestamp,
        }
    }

    pub fn to_update(&self) -> PositionUpdate {
        PositionUpdate {
            participant_id: self.user_id.clone(),
            lat: self.lat,
            lng: self.lng,
            timestamp: self.updated_at,
            online: true,
        }
    }
}

/// Identity row: one per participant, created once, `last_seen` refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: ParticipantId,
    pub color_hash: Color,
    pub created_at: u64,
    pub last_seen: u64,
}

impl IdentityRecord {
    pub fn new(id: ParticipantId, created_at: u64) -> Self {
        let color_hash = Color::from_id(&id);
        Self {
            id,
            color_hash,
            created_at,
            last_seen: created_at,
        }
    }
}

/// Converts a typed row into a store record.
pub fn to_record<T: Serialize>(row: &T) -> Result<Record, EnvError> {
    match serde_json::to_value(row)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(EnvError::SerializationError(format!(
            "expected an object row, got {}",
            other
        ))),
    }
}

/// Parses a store record into a typed row.
pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T, EnvError> {
    Ok(serde_json::from_value(serde_json::Value::Object(record))?)
}
