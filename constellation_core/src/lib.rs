//! Constellation Core - Real-Time Position Sync and Proximity Graph Engine
//!
//! Keeps every participant's view of who is where consistent under
//! duplicate, reordered and lost delivery, and derives a small "constellation"
//! graph of nearby participants from it:
//! 1. **PositionStore**: last-write-wins participant map with self-echo suppression and staleness eviction
//! 2. **ProximityGraphBuilder**: nearest-k primary edges plus neighbor-to-neighbor secondary edges
//! 3. **SyncChannel**: pub/sub broadcast, durable bootstrap for late joiners, connection state machine
//! 4. **Session**: the single-owner loop tying it together, with heartbeat and simulated agents

pub mod bots;
pub mod config;
pub mod error;
pub mod geomath;
pub mod heartbeat;
pub mod participant;
pub mod position_store;
pub mod proximity_graph;
pub mod records;
pub mod session;
pub mod sled_store;
pub mod sync_channel;

// Re-export key types for convenience
pub use bots::{Bot, BotDriver, BoundingBox};
pub use config::{BotConfig, GraphConfig, HeartbeatConfig, SessionConfig};
pub use error::SyncError;
pub use geomath::{distance_m, GeoPoint};
pub use heartbeat::{HeartbeatScheduler, PeriodicTimer};
pub use participant::{Color, Participant, PositionUpdate, LOCATION_EVENT};
pub use position_store::{PositionStore, Snapshot, UpsertOutcome};
pub use proximity_graph::{ConstellationEdges, Edge, EdgeKind, ProximityGraphBuilder};
pub use session::{Session, SessionHandle, SessionMessage, SessionPhase, ViewEvent};
pub use sled_store::SledStore;
pub use sync_channel::{ConnectionState, PublishReport, SyncChannel};
