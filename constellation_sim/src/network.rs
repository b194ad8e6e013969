//! In-memory pub/sub channel with fault injection.
//!
//! A single hub (owned by `BusController`) routes every publish to every
//! subscriber of the channel, the sender included, the way a realtime
//! broker echoes broadcasts. Each participant talks to the hub through
//! its own `MemoryBus` endpoint so that partitions know who is sending.

use async_trait::async_trait;
use constellation_env::{
    ChannelController, ChannelEvent, ChannelHandler, EnvError, ParticipantId, PubSubChannel,
    Subscription, TransportStatus,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Publishes accepted by the hub
    pub published: u64,

    /// Publishes refused (unreachable sender or injected failure)
    pub rejected: u64,

    /// Broadcast deliveries handed to a subscriber
    pub delivered: u64,

    /// Deliveries lost to partitions or the loss rate
    pub dropped: u64,

    /// Extra copies delivered
    pub duplicated: u64,

    /// Deliveries held back and released after a later publish
    pub reordered: u64,
}

struct Member {
    subscription: Subscription,
    handler: ChannelHandler,
}

type Delivery = (ChannelHandler, ChannelEvent);

struct HubState {
    members: Vec<Member>,
    next_id: u64,
    partitions: Vec<(Vec<ParticipantId>, Vec<ParticipantId>)>,
    unreachable: HashSet<ParticipantId>,
    loss_rate: f64,
    duplicate_rate: f64,
    reorder_rate: f64,
    publish_failure_rate: f64,
    held: Vec<Delivery>,
    rng: ChaCha8Rng,
    stats: BusStats,
}

impl HubState {
    fn can_communicate(&self, from: &ParticipantId, to: &ParticipantId) -> bool {
        for (group_a, group_b) in &self.partitions {
            let from_in_a = group_a.contains(from);
            let from_in_b = group_b.contains(from);
            let to_in_a = group_a.contains(to);
            let to_in_b = group_b.contains(to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }
        true
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen_bool(probability)
    }

    /// Presence leave for `member` to everyone else on `channel` who can hear it.
    fn leave_notices(&self, channel: &str, member: &ParticipantId) -> Vec<Delivery> {
        self.members
            .iter()
            .filter(|m| m.subscription.channel == channel && &m.subscription.member != member)
            .filter(|m| self.can_communicate(member, &m.subscription.member))
            .map(|m| (m.handler.clone(), ChannelEvent::PresenceLeave(member.clone())))
            .collect()
    }
}

/// Handlers run outside the hub lock.
fn dispatch(deliveries: Vec<Delivery>) {
    for (handler, event) in deliveries {
        handler(event);
    }
}

/// Fault-injection controls and endpoint factory for the shared hub.
#[derive(Clone)]
pub struct BusController {
    state: Arc<Mutex<HubState>>,
}

impl BusController {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                members: Vec::new(),
                next_id: 1,
                partitions: Vec::new(),
                unreachable: HashSet::new(),
                loss_rate: 0.0,
                duplicate_rate: 0.0,
                reorder_rate: 0.0,
                publish_failure_rate: 0.0,
                held: Vec::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: BusStats::default(),
            })),
        }
    }

    /// A transport endpoint for `local`.
    pub fn endpoint(&self, local: ParticipantId) -> MemoryBus {
        MemoryBus {
            local,
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_duplicate_rate(&self, rate: f64) {
        self.lock().duplicate_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_reorder_rate(&self, rate: f64) {
        self.lock().reorder_rate = rate.clamp(0.0, 1.0);
    }

    /// Probability that a publish call itself fails.
    pub fn set_publish_failure_rate(&self, rate: f64) {
        self.lock().publish_failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Clears every fault setting except partitions and reachability.
    pub fn calm(&self) {
        let mut state = self.lock();
        state.loss_rate = 0.0;
        state.duplicate_rate = 0.0;
        state.reorder_rate = 0.0;
        state.publish_failure_rate = 0.0;
    }

    /// An unreachable member can neither subscribe nor publish.
    pub fn set_reachable(&self, member: &ParticipantId, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable.remove(member);
        } else {
            state.unreachable.insert(member.clone());
        }
    }

    /// Reports a degraded connection to `member`'s subscriptions.
    pub fn degrade(&self, member: &ParticipantId, reason: &str) {
        self.notify(member, TransportStatus::Degraded(reason.to_string()));
    }

    /// Reports a recovered connection to `member`'s subscriptions.
    pub fn restore(&self, member: &ParticipantId) {
        self.notify(member, TransportStatus::Connected);
    }

    fn notify(&self, member: &ParticipantId, status: TransportStatus) {
        let deliveries: Vec<Delivery> = self
            .lock()
            .members
            .iter()
            .filter(|m| &m.subscription.member == member)
            .map(|m| (m.handler.clone(), ChannelEvent::Status(status.clone())))
            .collect();
        dispatch(deliveries);
    }

    /// Delivers everything held back for reordering. Returns how many.
    pub fn release_held(&self) -> usize {
        let held: Vec<Delivery> = self.lock().held.drain(..).collect();
        let count = held.len();
        dispatch(held);
        count
    }

    pub fn stats(&self) -> BusStats {
        self.lock().stats
    }

    /// Number of live subscriptions on `channel`.
    pub fn member_count(&self, channel: &str) -> usize {
        self.lock()
            .members
            .iter()
            .filter(|m| m.subscription.channel == channel)
            .count()
    }

    pub fn can_communicate(&self, from: &ParticipantId, to: &ParticipantId) -> bool {
        self.lock().can_communicate(from, to)
    }
}

impl ChannelController for BusController {
    fn partition(&self, group_a: &[ParticipantId], group_b: &[ParticipantId]) {
        self.lock().partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        self.lock().partitions.clear();
    }

    fn set_loss_rate(&self, loss_rate: f64) {
        self.lock().loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    fn disconnect(&self, member: &ParticipantId) {
        let deliveries = {
            let mut state = self.lock();
            let (dropped, kept): (Vec<Member>, Vec<Member>) = state
                .members
                .drain(..)
                .partition(|m| &m.subscription.member == member);
            state.members = kept;

            let mut deliveries = Vec::new();
            for m in dropped {
                deliveries.extend(state.leave_notices(&m.subscription.channel, member));
                deliveries.push((
                    m.handler,
                    ChannelEvent::Status(TransportStatus::Closed("connection dropped".into())),
                ));
            }
            deliveries
        };
        dispatch(deliveries);
    }
}

/// One participant's view of the hub.
pub struct MemoryBus {
    local: ParticipantId,
    state: Arc<Mutex<HubState>>,
}

impl MemoryBus {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PubSubChannel for MemoryBus {
    async fn subscribe(
        &self,
        channel: &str,
        member: &ParticipantId,
        handler: ChannelHandler,
    ) -> Result<Subscription, EnvError> {
        let (subscription, deliveries) = {
            let mut state = self.lock();
            if state.unreachable.contains(member) {
                return Err(EnvError::network(format!("{} is unreachable", member)));
            }

            let subscription = Subscription {
                id: state.next_id,
                channel: channel.to_string(),
                member: member.clone(),
            };
            state.next_id += 1;

            // Presence sync in both directions
            let mut deliveries = Vec::new();
            for m in &state.members {
                let other = &m.subscription.member;
                if m.subscription.channel != channel || other == member || !state.can_communicate(member, other) {
                    continue;
                }
                deliveries.push((m.handler.clone(), ChannelEvent::PresenceJoin(member.clone())));
                deliveries.push((handler.clone(), ChannelEvent::PresenceJoin(other.clone())));
            }

            state.members.push(Member {
                subscription: subscription.clone(),
                handler,
            });
            (subscription, deliveries)
        };

        dispatch(deliveries);
        Ok(subscription)
    }

    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<(), EnvError> {
        let deliveries = {
            let mut state = self.lock();
            let failure_rate = state.publish_failure_rate;
            if state.unreachable.contains(&self.local) || state.roll(failure_rate) {
                state.stats.rejected += 1;
                return Err(EnvError::network(format!("publish from {} refused", self.local)));
            }
            state.stats.published += 1;

            let targets: Vec<(ParticipantId, ChannelHandler)> = state
                .members
                .iter()
                .filter(|m| m.subscription.channel == channel)
                .map(|m| (m.subscription.member.clone(), m.handler.clone()))
                .collect();

            let mut out = Vec::new();
            let mut held_now = Vec::new();
            for (member, handler) in targets {
                if !state.can_communicate(&self.local, &member) || state.unreachable.contains(&member) {
                    state.stats.dropped += 1;
                    continue;
                }
                let (loss, reorder, duplicate) = (state.loss_rate, state.reorder_rate, state.duplicate_rate);
                if state.roll(loss) {
                    state.stats.dropped += 1;
                    continue;
                }

                let broadcast = ChannelEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                };
                if state.roll(reorder) {
                    state.stats.reordered += 1;
                    held_now.push((handler, broadcast));
                    continue;
                }
                if state.roll(duplicate) {
                    state.stats.duplicated += 1;
                    out.push((handler.clone(), broadcast.clone()));
                }
                state.stats.delivered += 1;
                out.push((handler, broadcast));
            }

            // Earlier held deliveries arrive after this publish's
            out.extend(state.held.drain(..));
            state.held.extend(held_now);
            out
        };

        dispatch(deliveries);
        Ok(())
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), EnvError> {
        let deliveries = {
            let mut state = self.lock();
            let before = state.members.len();
            state.members.retain(|m| m.subscription.id != subscription.id);
            if state.members.len() == before {
                // Already gone (e.g. dropped by a disconnect)
                return Ok(());
            }
            state.leave_notices(&subscription.channel, &subscription.member)
        };
        dispatch(deliveries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Inbox = Arc<Mutex<Vec<ChannelEvent>>>;

    fn inbox() -> (Inbox, ChannelHandler) {
        let events: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, Arc::new(move |event| sink.lock().unwrap().push(event)))
    }

    fn broadcasts(inbox: &Inbox) -> usize {
        inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Broadcast { .. }))
            .count()
    }

    fn id(name: &str) -> ParticipantId {
        ParticipantId::from(name)
    }

    #[tokio::test]
    async fn test_publish_reaches_everyone_including_sender() {
        let controller = BusController::new(1);
        let a = controller.endpoint(id("a"));
        let b = controller.endpoint(id("b"));
        let (a_inbox, a_handler) = inbox();
        let (b_inbox, b_handler) = inbox();
        a.subscribe("room", &id("a"), a_handler).await.unwrap();
        b.subscribe("room", &id("b"), b_handler).await.unwrap();

        a.publish("room", "location", json!({"n": 1})).await.unwrap();

        assert_eq!(broadcasts(&a_inbox), 1);
        assert_eq!(broadcasts(&b_inbox), 1);
        assert_eq!(controller.stats().delivered, 2);
        // Presence sync both ways
        assert!(a_inbox.lock().unwrap().contains(&ChannelEvent::PresenceJoin(id("b"))));
        assert!(b_inbox.lock().unwrap().contains(&ChannelEvent::PresenceJoin(id("a"))));
    }

    #[tokio::test]
    async fn test_partition_blocks_delivery() {
        let controller = BusController::new(1);
        let a = controller.endpoint(id("a"));
        let b = controller.endpoint(id("b"));
        let (_, a_handler) = inbox();
        let (b_inbox, b_handler) = inbox();
        a.subscribe("room", &id("a"), a_handler).await.unwrap();
        b.subscribe("room", &id("b"), b_handler).await.unwrap();

        controller.partition(&[id("a")], &[id("b")]);
        a.publish("room", "location", json!({})).await.unwrap();
        assert_eq!(broadcasts(&b_inbox), 0);
        assert!(!controller.can_communicate(&id("a"), &id("b")));

        controller.heal_all();
        a.publish("room", "location", json!({})).await.unwrap();
        assert_eq!(broadcasts(&b_inbox), 1);
    }

    #[tokio::test]
    async fn test_full_loss_and_full_duplication() {
        let controller = BusController::new(7);
        let a = controller.endpoint(id("a"));
        let (a_inbox, a_handler) = inbox();
        a.subscribe("room", &id("a"), a_handler).await.unwrap();

        controller.set_loss_rate(1.0);
        a.publish("room", "location", json!({})).await.unwrap();
        assert_eq!(broadcasts(&a_inbox), 0);

        controller.set_loss_rate(0.0);
        controller.set_duplicate_rate(1.0);
        a.publish("room", "location", json!({})).await.unwrap();
        assert_eq!(broadcasts(&a_inbox), 2);
        assert_eq!(controller.stats().duplicated, 1);
    }

    #[tokio::test]
    async fn test_reordered_delivery_arrives_after_next_publish() {
        let controller = BusController::new(3);
        let a = controller.endpoint(id("a"));
        let (a_inbox, a_handler) = inbox();
        a.subscribe("room", &id("a"), a_handler).await.unwrap();

        controller.set_reorder_rate(1.0);
        a.publish("room", "location", json!({"n": 1})).await.unwrap();
        assert_eq!(broadcasts(&a_inbox), 0);

        controller.set_reorder_rate(0.0);
        a.publish("room", "location", json!({"n": 2})).await.unwrap();

        let order: Vec<Value> = a_inbox
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Broadcast { payload, .. } => Some(payload["n"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![json!(2), json!(1)]);
        assert_eq!(controller.release_held(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_and_announces_leave() {
        let controller = BusController::new(1);
        let a = controller.endpoint(id("a"));
        let b = controller.endpoint(id("b"));
        let (a_inbox, a_handler) = inbox();
        let (b_inbox, b_handler) = inbox();
        a.subscribe("room", &id("a"), a_handler).await.unwrap();
        b.subscribe("room", &id("b"), b_handler).await.unwrap();

        controller.disconnect(&id("a"));

        assert!(matches!(
            a_inbox.lock().unwrap().last(),
            Some(ChannelEvent::Status(TransportStatus::Closed(_)))
        ));
        assert!(b_inbox.lock().unwrap().contains(&ChannelEvent::PresenceLeave(id("a"))));
        assert_eq!(controller.member_count("room"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_member_cannot_subscribe_or_publish() {
        let controller = BusController::new(1);
        let a = controller.endpoint(id("a"));
        controller.set_reachable(&id("a"), false);

        let (_, handler) = inbox();
        assert!(a.subscribe("room", &id("a"), handler).await.is_err());
        assert!(a.publish("room", "location", json!({})).await.is_err());
        assert_eq!(controller.stats().rejected, 1);

        controller.set_reachable(&id("a"), true);
        assert!(a.publish("room", "location", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let controller = BusController::new(1);
        let a = controller.endpoint(id("a"));
        let (_, handler) = inbox();
        let subscription = a.subscribe("room", &id("a"), handler).await.unwrap();

        a.unsubscribe(subscription.clone()).await.unwrap();
        a.unsubscribe(subscription).await.unwrap();
        assert_eq!(controller.member_count("room"), 0);
    }
}
