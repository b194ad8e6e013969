//! Constellation Deterministic Simulation Harness
//!
//! Runs many `Session`s against one in-memory bus and store, with every
//! source of non-determinism under control:
//! - **Time**: virtual clock advanced only by `SimWorld::step`
//! - **Network**: loss, duplication, reordering, partitions and dropped connections
//! - **Storage**: injected read and write failures
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  SimContext (virtual clock, seeded RNG streams)             │
//! │                                                             │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐                 │
//! │  │ Session  │   │ Session  │   │ Session  │  ...            │
//! │  │ + walker │   │ + bots   │   │          │                 │
//! │  └────┬─────┘   └────┬─────┘   └────┬─────┘                 │
//! │       │ MemoryBus    │              │                       │
//! │  ┌────▼──────────────▼──────────────▼─────┐  ┌───────────┐  │
//! │  │ hub (BusController: faults, presence)  │  │MemoryStore│  │
//! │  └────────────────────────────────────────┘  └───────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use constellation_sim::{ScenarioRunner, SimConfig};
//! use constellation_sim::scenarios::ScenarioId;
//!
//! let result = ScenarioRunner::new(SimConfig::default())
//!     .with_seed(42)
//!     .run(ScenarioId::FlakyNetwork)?;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod runner;
mod storage;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{EdgeFrame, ParticipantFrame, SimEvent, SimExport, SimFrame, ViewFrame};
pub use network::{BusController, BusStats, MemoryBus};
pub use runner::{ScenarioError, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use storage::MemoryStore;
pub use world::{Divergence, DivergenceKind, SimConfig, SimSession, SimWorld, WorldStats};
