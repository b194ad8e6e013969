//! Constellation Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Constellation
//! sync engine to run in both **Production** (tokio + real backends) and
//! **Simulation** (virtual clock + in-memory backends).
//!
//! # Core Concept: The Reactor Pattern
//!
//! For deterministic simulation testing, we intercept all I/O:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Publish/subscribe (`PubSubChannel`)
//! - Durable storage (`DurableStore`)
//! - Randomness (`derive_rng()`)
//!
//! By deriving all entropy from a single 64-bit seed, any bug becomes
//! reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use constellation_env::{ConstellationContext, PubSubChannel};
//!
//! async fn announce<Ctx: ConstellationContext, Bus: PubSubChannel>(ctx: &Ctx, bus: &Bus) {
//!     let payload = serde_json::json!({ "timestamp": ctx.unix_millis() });
//!     let _ = bus.publish("constellation", "location", payload).await;
//! }
//! ```

mod context;
mod network;
mod storage;
mod types;
mod error;
mod tokio_impl;

pub use context::ConstellationContext;
pub use network::{PubSubChannel, ChannelController};
pub use storage::{DurableStore, Filter, Record};
pub use types::{ChannelEvent, ChannelHandler, ParticipantId, Subscription, TransportStatus};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
