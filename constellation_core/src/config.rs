//! Session configuration.
//!
//! Every struct has a `Default` and deserializes with `#[serde(default)]`,
//! so a JSON config file only needs to name the fields it overrides.
//! Durations are written as milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::bots::BoundingBox;
use crate::error::SyncError;

/// Limits for the proximity graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Primary edge cutoff in meters (default: 500)
    pub max_distance_m: f64,

    /// Maximum primary edges from self (default: 5)
    pub max_connections: usize,

    /// Secondary edges need `distance < max_distance_m * secondary_factor` (default: 0.8)
    pub secondary_factor: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_distance_m: 500.0,
            max_connections: 5,
            secondary_factor: 0.8,
        }
    }
}

/// Periods for self re-broadcast and staleness eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Self re-publish period (default: 4s)
    #[serde(with = "duration_ms")]
    pub publish_interval: Duration,

    /// Prune pass period (default: 15s); never shorter than `publish_interval`
    #[serde(with = "duration_ms")]
    pub prune_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(4),
            prune_interval: Duration::from_secs(15),
        }
    }
}

/// Synthetic participants hosted by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Number of bots (default: 5)
    pub count: usize,

    /// Area the bots are confined to
    pub bounds: BoundingBox,

    /// Movement tick period (default: 2s)
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,

    /// Per-tick speed range in degrees (default: 0.00002 - 0.00008)
    pub min_speed_deg: f64,
    pub max_speed_deg: f64,

    /// Chance per tick of a heading perturbation (default: 0.1)
    pub turn_probability: f64,

    /// Largest heading perturbation in radians (default: 0.5)
    pub max_turn_rad: f64,

    /// RNG stream used to derive the bots' generator from the context seed
    pub rng_stream: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            count: 5,
            bounds: BoundingBox::default(),
            tick_interval: Duration::from_secs(2),
            min_speed_deg: 0.00002,
            max_speed_deg: 0.00008,
            turn_probability: 0.1,
            max_turn_rad: 0.5,
            rng_stream: 0xb075,
        }
    }
}

/// Top-level configuration for a `Session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pub/sub channel all participants join (default: "constellation")
    pub channel_name: String,

    pub graph: GraphConfig,

    pub heartbeat: HeartbeatConfig,

    /// Optional bot driver; `None` disables synthetic participants
    pub bots: Option<BotConfig>,

    /// Staleness threshold for remote participants and bootstrap rows (default: 10 min)
    #[serde(with = "duration_ms")]
    pub idle_window: Duration,

    /// Per-message dispatch tracing and store invariant checks
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_name: "constellation".to_string(),
            graph: GraphConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            bots: None,
            idle_window: Duration::from_secs(600),
            debug: false,
        }
    }
}

impl SessionConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.channel_name.is_empty() {
            return Err(SyncError::InvalidConfig("channel_name is empty".into()));
        }
        if !(self.graph.max_distance_m > 0.0) {
            return Err(SyncError::InvalidConfig("graph.max_distance_m must be positive".into()));
        }
        if !(self.graph.secondary_factor >= 0.0) {
            return Err(SyncError::InvalidConfig("graph.secondary_factor must be non-negative".into()));
        }
        if self.heartbeat.publish_interval.is_zero() || self.heartbeat.prune_interval.is_zero() {
            return Err(SyncError::InvalidConfig("heartbeat intervals must be non-zero".into()));
        }
        if self.idle_window.is_zero() {
            return Err(SyncError::InvalidConfig("idle_window must be non-zero".into()));
        }
        if let Some(bots) = &self.bots {
            if bots.tick_interval.is_zero() {
                return Err(SyncError::InvalidConfig("bots.tick_interval must be non-zero".into()));
            }
            if bots.min_speed_deg > bots.max_speed_deg || bots.min_speed_deg < 0.0 {
                return Err(SyncError::InvalidConfig("bots speed range is invalid".into()));
            }
            if !(0.0..=1.0).contains(&bots.turn_probability) {
                return Err(SyncError::InvalidConfig("bots.turn_probability must be in [0, 1]".into()));
            }
            bots.bounds.validate()?;
        }
        Ok(())
    }
}

/// Serde adapter: `Duration` <-> integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
