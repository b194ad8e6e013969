//! Core environment context trait for Constellation sessions.

use async_trait::async_trait;
use rand::rngs::StdRng;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the sync engine can run
/// both in production (tokio) and inside the deterministic simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `StdRng(seed)`
///
/// # Determinism
///
/// For simulation testing, all methods that would normally introduce
/// non-determinism (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait ConstellationContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for timers (heartbeat, pruning, bot ticks).
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for update timestamps and `last_seen`.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as milliseconds since the UNIX epoch.
    fn unix_millis(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Every I/O leg of the sync engine runs through here so that its
    /// completion re-enters the session loop as a new message.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns a random number generator for the given stream.
    ///
    /// In simulation the generator is derived from the master seed and
    /// `stream`, so bot trajectories and fault injection are reproducible.
    fn derive_rng(&self, stream: u64) -> StdRng;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
