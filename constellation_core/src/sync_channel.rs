//! SyncChannel - bridges the `PositionStore` to a pub/sub channel and a
//! durable store.
//!
//! The adapter owns the connection state machine and issues I/O as
//! detached futures. It never awaits anything itself: the session spawns
//! the returned futures and feeds their completions back, tagged with the
//! generation they were issued under.
//!
//! ```text
//!                 begin_connect            on_subscribed(Ok)
//!  Disconnected ───────────────> Connecting ────────────────> Subscribed
//!       ^                            │                          │   ^
//!       │      subscribe failed      │        publish failed    v   │ clean publish
//!       ├────────────────────────────┘                        Degraded
//!       │                                                        │
//!       └──────────── teardown / transport closed ───────────────┘
//! ```

use constellation_env::{
    ChannelEvent, ChannelHandler, DurableStore, EnvError, Filter, ParticipantId, PubSubChannel,
    Subscription, TransportStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use crate::error::SyncError;
use crate::participant::{Color, PositionUpdate, LOCATION_EVENT};
use crate::position_store::{PositionStore, UpsertOutcome};
use crate::records::{
    from_record, to_record, IdentityRecord, LocationRecord, LOCATIONS_KEY, LOCATIONS_TABLE,
    USERS_KEY, USERS_TABLE,
};

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Degraded,
}

impl ConnectionState {
    /// Subscribed or Degraded: the heartbeat and bots run in both.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Subscribed | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Which legs of a publish succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub broadcast_ok: bool,
    pub persist_ok: bool,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.broadcast_ok && self.persist_ok
    }
}

/// A location row read back during bootstrap, with its stored color if any.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapEntry {
    pub update: PositionUpdate,
    pub color: Option<Color>,
}

#[derive(Debug, PartialEq)]
pub enum SubscribeOutcome {
    /// The channel is now `Subscribed`
    Active,

    /// Subscribing failed; the channel is back to `Disconnected`
    Failed(SyncError),

    /// Completion from an abandoned connection attempt. A subscription that
    /// did succeed must still be released.
    Stale(Option<Subscription>),
}

/// What a remote event did to the local view.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Upserted(UpsertOutcome),

    /// Presence join created or revived an entry
    Joined,

    /// Presence leave removed an entry
    Departed,

    /// Transport status moved the connection to a new state
    StateChanged(ConnectionState),

    /// Transport closed: the view has been cleared. Always `ConnectionLost`.
    Lost(SyncError),

    /// Nothing changed
    Unchanged,

    /// Not an event this adapter handles
    Ignored,
}

impl RemoteOutcome {
    /// Whether the graph needs recomputing.
    pub fn changed(&self) -> bool {
        match self {
            RemoteOutcome::Upserted(outcome) => outcome.changed(),
            RemoteOutcome::Joined | RemoteOutcome::Departed | RemoteOutcome::Lost(_) => true,
            _ => false,
        }
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct SyncChannel<Bus, Db>
where
    Bus: PubSubChannel,
    Db: DurableStore,
{
    bus: Arc<Bus>,
    db: Arc<Db>,
    channel_name: String,
    self_id: ParticipantId,
    state: ConnectionState,
    generation: u64,
    subscription: Option<Subscription>,

    /// Newest `updated_at` written per participant. Held across the upsert
    /// so concurrent publishes never move a row backwards.
    persisted: Arc<Mutex<HashMap<ParticipantId, u64>>>,
}

impl<Bus, Db> SyncChannel<Bus, Db>
where
    Bus: PubSubChannel,
    Db: DurableStore,
{
    pub fn new(bus: Arc<Bus>, db: Arc<Db>, channel_name: impl Into<String>, self_id: ParticipantId) -> Self {
        Self {
            bus,
            db,
            channel_name: channel_name.into(),
            self_id,
            state: ConnectionState::Disconnected,
            generation: 0,
            subscription: None,
            persisted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// True if a completion tagged `generation` still belongs to a live attempt.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state != ConnectionState::Disconnected
    }

    /// True if `generation` is the attempt still waiting for its subscription.
    pub fn is_connecting(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Connecting
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// `Disconnected -> Connecting`, opening a new generation.
    pub fn begin_connect(&mut self) -> Result<u64, SyncError> {
        if self.state != ConnectionState::Disconnected {
            return Err(SyncError::InvalidState {
                expected: "disconnected",
                found: self.state,
            });
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        debug!(channel = %self.channel_name, generation = self.generation, "Connecting");
        Ok(self.generation)
    }

    pub fn subscribe_task(
        &self,
        handler: ChannelHandler,
    ) -> impl Future<Output = Result<Subscription, EnvError>> + Send + 'static {
        let bus = self.bus.clone();
        let channel = self.channel_name.clone();
        let member = self.self_id.clone();
        async move { bus.subscribe(&channel, &member, handler).await }
    }

    pub fn on_subscribed(
        &mut self,
        generation: u64,
        result: Result<Subscription, EnvError>,
    ) -> SubscribeOutcome {
        if !self.is_connecting(generation) {
            debug!(generation, current = self.generation, "Discarding stale subscription");
            return SubscribeOutcome::Stale(result.ok());
        }

        match result {
            Ok(subscription) => {
                info!(channel = %self.channel_name, id = subscription.id, "Subscribed");
                self.subscription = Some(subscription);
                self.state = ConnectionState::Subscribed;
                SubscribeOutcome::Active
            }
            Err(e) => {
                warn!(channel = %self.channel_name, error = %e, "Subscribe failed");
                self.state = ConnectionState::Disconnected;
                SubscribeOutcome::Failed(SyncError::TransientIo(e))
            }
        }
    }

    pub fn unsubscribe_task(&self, subscription: Subscription) -> impl Future<Output = ()> + Send + 'static {
        let bus = self.bus.clone();
        async move {
            if let Err(e) = bus.unsubscribe(subscription).await {
                warn!(error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Voluntary disconnect: returns the task that announces self offline
    /// and leaves the channel, or `None` if already disconnected.
    ///
    /// The view is cleared immediately and the generation bumped, so any
    /// completion still in flight is discarded on arrival.
    pub fn teardown(
        &mut self,
        store: &mut PositionStore,
        now_ms: u64,
    ) -> Option<impl Future<Output = ()> + Send + 'static> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }

        let was_live = self.state.is_live();
        let farewell = store
            .self_position()
            .filter(|_| was_live)
            .map(|position| PositionUpdate::offline(self.self_id.clone(), position, now_ms));
        let subscription = self.subscription.take();

        self.state = ConnectionState::Disconnected;
        self.generation += 1;
        let cleared = store.clear_others();
        info!(channel = %self.channel_name, cleared, "Disconnected");

        let bus = self.bus.clone();
        let channel = self.channel_name.clone();
        Some(async move {
            if let Some(update) = farewell {
                if let Err(e) = bus.publish(&channel, LOCATION_EVENT, update.to_payload()).await {
                    warn!(error = %e, "Offline announcement failed");
                }
            }
            if let Some(subscription) = subscription {
                if let Err(e) = bus.unsubscribe(subscription).await {
                    warn!(error = %e, "Unsubscribe failed");
                }
            }
        })
    }

    /// Involuntary disconnect: the transport is gone, so nothing is sent.
    pub fn mark_lost(&mut self, store: &mut PositionStore) -> usize {
        self.subscription = None;
        self.state = ConnectionState::Disconnected;
        self.generation += 1;
        store.clear_others()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Publishes the local participant's position, if it has one.
    pub fn publish_self(
        &self,
        store: &PositionStore,
        now_ms: u64,
    ) -> Option<impl Future<Output = PublishReport> + Send + 'static> {
        let position = store.self_position()?;
        Some(self.publish_update(PositionUpdate::new(self.self_id.clone(), position, now_ms)))
    }

    /// Broadcasts `update` and persists it as a location row.
    ///
    /// Both legs always run; failures are logged and reported, never raised.
    /// A row older than one this channel already wrote is not persisted.
    pub fn publish_update(
        &self,
        update: PositionUpdate,
    ) -> impl Future<Output = PublishReport> + Send + 'static {
        let bus = self.bus.clone();
        let db = self.db.clone();
        let channel = self.channel_name.clone();
        let persisted = self.persisted.clone();

        async move {
            let broadcast = bus.publish(&channel, LOCATION_EVENT, update.to_payload()).await;
            if let Err(e) = &broadcast {
                warn!(id = %update.participant_id, error = %e, "Broadcast failed");
            }

            let persist = {
                let mut written = persisted.lock().await;
                match written.get(&update.participant_id) {
                    Some(&newest) if newest > update.timestamp => {
                        trace!(
                            id = %update.participant_id,
                            newest,
                            skipped = update.timestamp,
                            "Location row already newer"
                        );
                        Ok(())
                    }
                    _ => {
                        let result = match to_record(&LocationRecord::from_update(&update)) {
                            Ok(row) => db.upsert(LOCATIONS_TABLE, row, LOCATIONS_KEY).await,
                            Err(e) => Err(e),
                        };
                        if result.is_ok() {
                            written.insert(update.participant_id.clone(), update.timestamp);
                        }
                        result
                    }
                }
            };
            if let Err(e) = &persist {
                warn!(id = %update.participant_id, error = %e, "Location upsert failed");
            }

            PublishReport {
                broadcast_ok: broadcast.is_ok(),
                persist_ok: persist.is_ok(),
            }
        }
    }

    /// Upserts the identity row of `id` (self or a hosted bot), keeping
    /// `created_at` if one exists.
    pub fn identity_task(
        &self,
        id: ParticipantId,
        now_ms: u64,
    ) -> impl Future<Output = Result<(), EnvError>> + Send + 'static {
        let db = self.db.clone();

        async move {
            let existing = db
                .select(USERS_TABLE, &Filter::eq(USERS_KEY, id.as_str()))
                .await?
                .into_iter()
                .next()
                .and_then(|row| from_record::<IdentityRecord>(row).ok());

            let mut identity = existing.unwrap_or_else(|| IdentityRecord::new(id, now_ms));
            identity.last_seen = now_ms;
            db.upsert(USERS_TABLE, to_record(&identity)?, USERS_KEY).await
        }
    }

    /// Reads back every location newer than the idle window, excluding self,
    /// joined with stored colors. Entries are sorted by participant id.
    pub fn bootstrap_task(
        &self,
        idle_window: Duration,
        now_ms: u64,
    ) -> impl Future<Output = Result<Vec<BootstrapEntry>, EnvError>> + Send + 'static {
        let db = self.db.clone();
        let self_id = self.self_id.clone();
        let cutoff = now_ms.saturating_sub(idle_window.as_millis() as u64);

        async move {
            let filter = Filter::And(vec![
                Filter::gte("updated_at", cutoff),
                Filter::ne(LOCATIONS_KEY, self_id.as_str()),
            ]);
            let mut locations = Vec::new();
            for row in db.select(LOCATIONS_TABLE, &filter).await? {
                match from_record::<LocationRecord>(row) {
                    Ok(location) => locations.push(location),
                    Err(e) => warn!(error = %e, "Skipping malformed location row"),
                }
            }
            if locations.is_empty() {
                return Ok(Vec::new());
            }

            let ids: Vec<Value> = locations.iter().map(|l| Value::from(l.user_id.as_str())).collect();
            let colors: HashMap<ParticipantId, Color> =
                match db.select(USERS_TABLE, &Filter::any_of(USERS_KEY, ids)).await {
                    Ok(rows) => rows
                        .into_iter()
                        .filter_map(|row| from_record::<IdentityRecord>(row).ok())
                        .map(|identity| (identity.id, identity.color_hash))
                        .collect(),
                    Err(e) => {
                        warn!(error = %e, "Identity lookup failed; using derived colors");
                        HashMap::new()
                    }
                };

            let mut entries: Vec<BootstrapEntry> = locations
                .into_iter()
                .map(|location| BootstrapEntry {
                    color: colors.get(&location.user_id).cloned(),
                    update: location.to_update(),
                })
                .collect();
            entries.sort_by(|a, b| a.update.participant_id.cmp(&b.update.participant_id));
            Ok(entries)
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Feeds bootstrap rows through the normal upsert path. Returns true if
    /// anything changed.
    pub fn apply_bootstrap(&self, store: &mut PositionStore, entries: Vec<BootstrapEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            let outcome = store.upsert_other(&entry.update);
            if outcome == UpsertOutcome::Invalid {
                warn!(
                    id = %entry.update.participant_id,
                    lat = entry.update.lat,
                    lng = entry.update.lng,
                    "Skipping out-of-range location row"
                );
                continue;
            }
            changed |= outcome.changed();
            if let Some(color) = entry.color {
                changed |= store.set_color(&entry.update.participant_id, color);
            }
        }
        debug!(participants = store.others_len(), "Bootstrap applied");
        changed
    }

    /// Applies one inbound channel event to the store.
    ///
    /// Malformed location payloads are returned as `InvalidPayload` with no
    /// state change.
    pub fn on_remote_event(
        &mut self,
        store: &mut PositionStore,
        event: ChannelEvent,
        now_ms: u64,
    ) -> Result<RemoteOutcome, SyncError> {
        match event {
            ChannelEvent::Broadcast { event, payload } => {
                if event != LOCATION_EVENT {
                    trace!(event = %event, "Ignoring unknown broadcast");
                    return Ok(RemoteOutcome::Ignored);
                }
                let update = PositionUpdate::from_payload(&payload)?;
                Ok(RemoteOutcome::Upserted(store.upsert_other(&update)))
            }
            ChannelEvent::PresenceJoin(id) => {
                if store.mark_present(&id, now_ms) {
                    debug!(id = %id, "Presence join");
                    Ok(RemoteOutcome::Joined)
                } else {
                    Ok(RemoteOutcome::Unchanged)
                }
            }
            ChannelEvent::PresenceLeave(id) => {
                if id != self.self_id && store.remove(&id) {
                    debug!(id = %id, "Presence leave");
                    Ok(RemoteOutcome::Departed)
                } else {
                    Ok(RemoteOutcome::Unchanged)
                }
            }
            ChannelEvent::Status(status) => Ok(self.on_transport_status(store, status)),
        }
    }

    pub fn on_transport_status(&mut self, store: &mut PositionStore, status: TransportStatus) -> RemoteOutcome {
        match (status, self.state) {
            (TransportStatus::Connected, ConnectionState::Degraded) => {
                info!("Transport recovered");
                self.state = ConnectionState::Subscribed;
                RemoteOutcome::StateChanged(self.state)
            }
            (TransportStatus::Degraded(reason), ConnectionState::Subscribed) => {
                warn!(reason = %reason, "Transport degraded");
                self.state = ConnectionState::Degraded;
                RemoteOutcome::StateChanged(self.state)
            }
            (TransportStatus::Closed(reason), state) if state != ConnectionState::Disconnected => {
                let cleared = self.mark_lost(store);
                warn!(reason = %reason, cleared, "Connection lost");
                RemoteOutcome::Lost(SyncError::ConnectionLost(reason))
            }
            _ => RemoteOutcome::Unchanged,
        }
    }

    /// Folds an I/O completion into `Subscribed <-> Degraded`.
    ///
    /// Returns the new state when it changed.
    pub fn record_io_result(&mut self, generation: u64, clean: bool) -> Option<ConnectionState> {
        if generation != self.generation {
            return None;
        }
        let next = match (self.state, clean) {
            (ConnectionState::Subscribed, false) => ConnectionState::Degraded,
            (ConnectionState::Degraded, true) => ConnectionState::Subscribed,
            _ => return None,
        };
        info!(from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geomath::GeoPoint;
    use crate::sled_store::SledStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Value)>>,
        unsubscribed: Mutex<Vec<u64>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl PubSubChannel for RecordingBus {
        async fn subscribe(
            &self,
            channel: &str,
            member: &ParticipantId,
            _handler: ChannelHandler,
        ) -> Result<Subscription, EnvError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EnvError::network("refused"));
            }
            Ok(Subscription {
                id: 1,
                channel: channel.to_string(),
                member: member.clone(),
            })
        }

        async fn publish(&self, _channel: &str, event: &str, payload: Value) -> Result<(), EnvError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EnvError::network("down"));
            }
            self.published.lock().unwrap().push((event.to_string(), payload));
            Ok(())
        }

        async fn unsubscribe(&self, subscription: Subscription) -> Result<(), EnvError> {
            self.unsubscribed.lock().unwrap().push(subscription.id);
            Ok(())
        }
    }

    struct Fixture {
        bus: Arc<RecordingBus>,
        db: Arc<SledStore>,
        channel: SyncChannel<RecordingBus, SledStore>,
        store: PositionStore,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(RecordingBus::default());
        let db = Arc::new(SledStore::open_temp().unwrap());
        let me = ParticipantId::from("me");
        Fixture {
            channel: SyncChannel::new(bus.clone(), db.clone(), "test", me.clone()),
            store: PositionStore::new(me, 0),
            bus,
            db,
        }
    }

    fn noop_handler() -> ChannelHandler {
        Arc::new(|_| {})
    }

    fn point(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng).unwrap()
    }

    async fn subscribed(f: &mut Fixture) -> u64 {
        let generation = f.channel.begin_connect().unwrap();
        let result = f.channel.subscribe_task(noop_handler()).await;
        assert_eq!(f.channel.on_subscribed(generation, result), SubscribeOutcome::Active);
        generation
    }

    #[tokio::test]
    async fn test_connect_state_machine() {
        let mut f = fixture();
        assert_eq!(f.channel.state(), ConnectionState::Disconnected);

        let generation = subscribed(&mut f).await;

        assert_eq!(f.channel.state(), ConnectionState::Subscribed);
        assert!(f.channel.is_current(generation));
        assert!(matches!(
            f.channel.begin_connect(),
            Err(SyncError::InvalidState { found: ConnectionState::Subscribed, .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_failure_returns_to_disconnected() {
        let mut f = fixture();
        f.bus.fail.store(true, Ordering::SeqCst);

        let generation = f.channel.begin_connect().unwrap();
        let result = f.channel.subscribe_task(noop_handler()).await;

        assert!(matches!(
            f.channel.on_subscribed(generation, result),
            SubscribeOutcome::Failed(SyncError::TransientIo(_))
        ));
        assert_eq!(f.channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_writes_broadcast_and_row() {
        let mut f = fixture();
        subscribed(&mut f).await;
        f.store.upsert_self(point(44.4268, 26.1025), 1_000);

        let report = f.channel.publish_self(&f.store, 1_000).unwrap().await;

        assert!(report.is_clean());
        let published = f.bus.published.lock().unwrap();
        assert_eq!(published[0].0, LOCATION_EVENT);
        assert_eq!(published[0].1["participantId"], json!("me"));
        let rows = f.db.select(LOCATIONS_TABLE, &Filter::All).await.unwrap();
        assert_eq!(rows[0]["updated_at"], json!(1_000));
    }

    #[tokio::test]
    async fn test_out_of_order_publishes_keep_newest_row() {
        let mut f = fixture();
        subscribed(&mut f).await;
        let me = ParticipantId::from("me");

        let newer = f.channel.publish_update(PositionUpdate::new(me.clone(), point(2.0, 2.0), 20));
        let older = f.channel.publish_update(PositionUpdate::new(me, point(1.0, 1.0), 10));
        assert!(newer.await.is_clean());
        assert!(older.await.is_clean());

        let rows = f.db.select(LOCATIONS_TABLE, &Filter::All).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["updated_at"], json!(20));
        assert_eq!(rows[0]["lat"], json!(2.0));
        // Both still went out on the channel
        assert_eq!(f.bus.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_position_is_skipped() {
        let f = fixture();
        assert!(f.channel.publish_self(&f.store, 1_000).is_none());
    }

    #[tokio::test]
    async fn test_failed_publish_degrades_then_recovers() {
        let mut f = fixture();
        let generation = subscribed(&mut f).await;
        f.bus.fail.store(true, Ordering::SeqCst);

        let update = PositionUpdate::new(ParticipantId::from("me"), point(1.0, 1.0), 5);
        let report = f.channel.publish_update(update.clone()).await;
        assert!(!report.broadcast_ok);
        assert!(report.persist_ok);
        assert_eq!(
            f.channel.record_io_result(generation, report.is_clean()),
            Some(ConnectionState::Degraded)
        );

        f.bus.fail.store(false, Ordering::SeqCst);
        let report = f.channel.publish_update(update).await;
        assert_eq!(
            f.channel.record_io_result(generation, report.is_clean()),
            Some(ConnectionState::Subscribed)
        );
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let mut f = fixture();
        let old = subscribed(&mut f).await;

        f.channel.teardown(&mut f.store, 10).unwrap().await;
        let fresh = f.channel.begin_connect().unwrap();

        assert_ne!(old, fresh);
        assert!(!f.channel.is_current(old));
        assert_eq!(f.channel.record_io_result(old, false), None);

        let late = f.channel.subscribe_task(noop_handler()).await;
        assert!(matches!(f.channel.on_subscribed(old, late), SubscribeOutcome::Stale(Some(_))));
        assert_eq!(f.channel.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_remote_events_reach_store() {
        let mut f = fixture();
        subscribed(&mut f).await;

        let update = PositionUpdate::new(ParticipantId::from("peer"), point(44.0, 26.0), 100);
        let event = ChannelEvent::Broadcast {
            event: LOCATION_EVENT.to_string(),
            payload: update.to_payload(),
        };
        let outcome = f.channel.on_remote_event(&mut f.store, event, 100).unwrap();
        assert_eq!(outcome, RemoteOutcome::Upserted(UpsertOutcome::Inserted));

        let echo = ChannelEvent::Broadcast {
            event: LOCATION_EVENT.to_string(),
            payload: PositionUpdate::new(ParticipantId::from("me"), point(0.0, 0.0), 200).to_payload(),
        };
        let outcome = f.channel.on_remote_event(&mut f.store, echo, 200).unwrap();
        assert_eq!(outcome, RemoteOutcome::Upserted(UpsertOutcome::SelfEcho));

        let leave = ChannelEvent::PresenceLeave(ParticipantId::from("peer"));
        assert_eq!(f.channel.on_remote_event(&mut f.store, leave, 300).unwrap(), RemoteOutcome::Departed);
        assert_eq!(f.store.others_len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected_without_change() {
        let mut f = fixture();
        subscribed(&mut f).await;

        for payload in [
            json!({"participantId": "peer"}),
            json!({"participantId": "peer", "lat": 91.0, "lng": 0.0, "timestamp": 1}),
            json!("garbage"),
        ] {
            let event = ChannelEvent::Broadcast {
                event: LOCATION_EVENT.to_string(),
                payload,
            };
            assert!(matches!(
                f.channel.on_remote_event(&mut f.store, event, 1),
                Err(SyncError::InvalidPayload(_))
            ));
        }
        assert_eq!(f.store.others_len(), 0);
    }

    #[tokio::test]
    async fn test_transport_close_clears_view() {
        let mut f = fixture();
        subscribed(&mut f).await;
        f.store.mark_present(&ParticipantId::from("peer"), 1);

        let outcome = f.channel.on_remote_event(
            &mut f.store,
            ChannelEvent::Status(TransportStatus::Closed("socket reset".into())),
            2,
        );

        assert_eq!(
            outcome.unwrap(),
            RemoteOutcome::Lost(SyncError::ConnectionLost("socket reset".into()))
        );
        assert_eq!(f.channel.state(), ConnectionState::Disconnected);
        assert_eq!(f.store.others_len(), 0);
    }

    #[tokio::test]
    async fn test_teardown_announces_offline_and_unsubscribes() {
        let mut f = fixture();
        subscribed(&mut f).await;
        f.store.upsert_self(point(10.0, 10.0), 1);
        f.store.mark_present(&ParticipantId::from("peer"), 1);

        f.channel.teardown(&mut f.store, 50).unwrap().await;

        let published = f.bus.published.lock().unwrap();
        let farewell = PositionUpdate::from_payload(&published[0].1).unwrap();
        assert!(!farewell.online);
        assert_eq!(farewell.timestamp, 50);
        assert_eq!(*f.bus.unsubscribed.lock().unwrap(), vec![1]);
        assert_eq!(f.store.others_len(), 0);
        assert!(f.channel.teardown(&mut f.store, 60).is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_filters_window_and_self() {
        let f = fixture();
        let rows = [("me", 9_000), ("fresh", 9_500), ("old", 1_000)];
        for (id, ts) in rows {
            let update = PositionUpdate::new(ParticipantId::from(id), point(1.0, 1.0), ts);
            let row = to_record(&LocationRecord::from_update(&update)).unwrap();
            f.db.upsert(LOCATIONS_TABLE, row, LOCATIONS_KEY).await.unwrap();
        }
        let mut identity = IdentityRecord::new(ParticipantId::from("fresh"), 0);
        identity.color_hash = Color::from_hash("#123456");
        f.db.upsert(USERS_TABLE, to_record(&identity).unwrap(), USERS_KEY).await.unwrap();

        let entries = f.channel.bootstrap_task(Duration::from_secs(5), 10_000).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].update.participant_id.as_str(), "fresh");
        assert_eq!(entries[0].color, Some(Color::from_hash("#123456")));

        let mut store = PositionStore::new(ParticipantId::from("me"), 0);
        assert!(f.channel.apply_bootstrap(&mut store, entries));
        assert_eq!(store.get(&ParticipantId::from("fresh")).unwrap().color.as_str(), "#123456");
    }

    #[tokio::test]
    async fn test_bootstrap_skips_out_of_range_rows() {
        let f = fixture();
        let mut bad = PositionUpdate::new(ParticipantId::from("bad"), point(1.0, 1.0), 10);
        bad.lat = 123.0;
        let entries = vec![
            BootstrapEntry {
                update: bad,
                color: Some(Color::from_hash("#ff0000")),
            },
            BootstrapEntry {
                update: PositionUpdate::new(ParticipantId::from("good"), point(2.0, 2.0), 10),
                color: None,
            },
        ];

        let mut store = PositionStore::new(ParticipantId::from("me"), 0);
        assert!(f.channel.apply_bootstrap(&mut store, entries));

        assert_eq!(store.others_len(), 1);
        assert!(store.get(&ParticipantId::from("bad")).is_none());
        assert!(store.get(&ParticipantId::from("good")).is_some());
    }

    #[tokio::test]
    async fn test_identity_keeps_created_at() {
        let f = fixture();
        let me = ParticipantId::from("me");
        f.channel.identity_task(me.clone(), 100).await.unwrap();
        f.channel.identity_task(me, 900).await.unwrap();

        let rows = f.db.select(USERS_TABLE, &Filter::All).await.unwrap();
        let identity: IdentityRecord = from_record(rows[0].clone()).unwrap();
        assert_eq!(identity.created_at, 100);
        assert_eq!(identity.last_seen, 900);
        assert_eq!(identity.color_hash, Color::from_id(&ParticipantId::from("me")));
    }
}
