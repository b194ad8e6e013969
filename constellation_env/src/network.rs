//! Publish/subscribe transport abstraction.

use async_trait::async_trait;
use serde_json::Value;
use crate::error::EnvError;
use crate::types::{ChannelHandler, ParticipantId, Subscription};

/// Abstraction over a broadcast + presence channel backend.
///
/// # Implementations
///
/// - **Production**: a realtime broker (websocket pub/sub)
/// - **Simulation**: `MemoryBus` with configurable loss, duplication and partitions
///
/// # Event Flow
///
/// ```text
/// Session A                  Channel                   Session B
///   |                           |                          |
///   |-- publish(location) ----->|                          |
///   |                           |-- handler(Broadcast) --->|
///   |-- subscribe(member A) --->|-- handler(PresenceJoin)->|
/// ```
#[async_trait]
pub trait PubSubChannel: Send + Sync + 'static {
    /// Joins `channel` as `member`, routing every inbound event to `handler`.
    ///
    /// The handler is invoked from the transport's own task; implementations
    /// must not block inside it.
    async fn subscribe(
        &self,
        channel: &str,
        member: &ParticipantId,
        handler: ChannelHandler,
    ) -> Result<Subscription, EnvError>;

    /// Publishes a named event on `channel`.
    ///
    /// # Note
    /// Success does not guarantee delivery. There is no acknowledgment.
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<(), EnvError>;

    /// Leaves the channel. The handler receives no events afterwards.
    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), EnvError>;
}

/// Fault-injection controls for a simulated channel backend.
pub trait ChannelController: Send + Sync {
    /// Creates a partition between two member sets.
    fn partition(&self, group_a: &[ParticipantId], group_b: &[ParticipantId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets the probability (0.0 - 1.0) that a delivery is dropped.
    fn set_loss_rate(&self, loss_rate: f64);

    /// Forcibly drops a member's subscriptions, as if its connection died.
    fn disconnect(&self, member: &ParticipantId);
}
