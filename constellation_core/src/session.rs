//! Session - owns one participant's view and drives it from a single loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Session                             │
//! │                                                              │
//! │  SessionHandle ──┐                                           │
//! │  channel handler ┼──> mpsc<SessionMessage> ──> handle_message│
//! │  I/O completions ┘                                │          │
//! │                                                   v          │
//! │   PositionStore ──> ProximityGraphBuilder ──> ViewEvent      │
//! │        ^                                                     │
//! │   SyncChannel (bootstrap, subscribe, publish, teardown)      │
//! │   HeartbeatScheduler + BotDriver (polled by on_timer)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every message is handled to completion with `&mut self`; no lock guards
//! the participant map. I/O runs in tasks spawned through the context and
//! re-enters the queue as a completion message carrying its generation.
//!
//! # Usage
//!
//! ```ignore
//! let session = Session::new(ctx, bus, db, ParticipantId::new(), SessionConfig::default())?;
//! let handle = session.handle();
//! tokio::spawn(session.run());
//!
//! handle.connect()?;
//! handle.update_position(44.4268, 26.1025)?;
//! ```

use constellation_env::{
    ChannelEvent, ChannelHandler, ConstellationContext, DurableStore, EnvError, ParticipantId,
    PubSubChannel, Subscription,
};
use rand::rngs::StdRng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};
use crate::bots::BotDriver;
use crate::config::SessionConfig;
use crate::error::SyncError;
use crate::geomath::GeoPoint;
use crate::heartbeat::HeartbeatScheduler;
use crate::participant::PositionUpdate;
use crate::position_store::{PositionStore, Snapshot};
use crate::proximity_graph::{ConstellationEdges, ProximityGraphBuilder};
use crate::sync_channel::{
    BootstrapEntry, ConnectionState, PublishReport, RemoteOutcome, SubscribeOutcome, SyncChannel,
};

const VIEW_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Active,
    Disposed,
}

/// Everything the session loop reacts to.
#[derive(Debug)]
pub enum SessionMessage {
    LocalPosition(GeoPoint),
    Connect,
    Disconnect,
    Dispose,

    /// Inbound transport event, tagged with the subscription's generation
    Channel { generation: u64, event: ChannelEvent },

    Bootstrapped {
        generation: u64,
        result: Result<Vec<BootstrapEntry>, EnvError>,
    },
    Subscribed {
        generation: u64,
        result: Result<Subscription, EnvError>,
    },
    PublishCompleted { generation: u64, report: PublishReport },
    IdentityStored {
        generation: u64,
        result: Result<(), EnvError>,
    },
    BotsCleaned(Result<usize, SyncError>),
    TeardownCompleted,
    Unsubscribed,
}

impl SessionMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionMessage::LocalPosition(_) => "local_position",
            SessionMessage::Connect => "connect",
            SessionMessage::Disconnect => "disconnect",
            SessionMessage::Dispose => "dispose",
            SessionMessage::Channel { .. } => "channel",
            SessionMessage::Bootstrapped { .. } => "bootstrapped",
            SessionMessage::Subscribed { .. } => "subscribed",
            SessionMessage::PublishCompleted { .. } => "publish_completed",
            SessionMessage::IdentityStored { .. } => "identity_stored",
            SessionMessage::BotsCleaned(_) => "bots_cleaned",
            SessionMessage::TeardownCompleted => "teardown_completed",
            SessionMessage::Unsubscribed => "unsubscribed",
        }
    }

    /// Completions of I/O spawned by the session itself.
    pub fn is_io_completion(&self) -> bool {
        matches!(
            self,
            SessionMessage::Bootstrapped { .. }
                | SessionMessage::Subscribed { .. }
                | SessionMessage::PublishCompleted { .. }
                | SessionMessage::IdentityStored { .. }
                | SessionMessage::BotsCleaned(_)
                | SessionMessage::TeardownCompleted
                | SessionMessage::Unsubscribed
        )
    }
}

/// Change notifications for renderers.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// Snapshot and edges changed; `revision` increases monotonically
    Changed { revision: u64 },

    /// Participants evicted by the staleness pass
    Pruned(Vec<ParticipantId>),

    Status(ConnectionState),
}

/// Cloneable sender side of a session's queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    /// Validates and enqueues a local position.
    pub fn update_position(&self, lat: f64, lng: f64) -> Result<(), SyncError> {
        let position = GeoPoint::new(lat, lng)?;
        self.send(SessionMessage::LocalPosition(position))
    }

    pub fn connect(&self) -> Result<(), SyncError> {
        self.send(SessionMessage::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SyncError> {
        self.send(SessionMessage::Disconnect)
    }

    pub fn dispose(&self) -> Result<(), SyncError> {
        self.send(SessionMessage::Dispose)
    }

    pub fn send(&self, message: SessionMessage) -> Result<(), SyncError> {
        self.tx.send(message).map_err(|_| SyncError::SessionClosed)
    }
}

enum LoopEvent {
    Message(Option<SessionMessage>),
    Timer,
}

pub struct Session<Ctx, Bus, Db>
where
    Ctx: ConstellationContext,
    Bus: PubSubChannel,
    Db: DurableStore,
{
    context: Arc<Ctx>,
    db: Arc<Db>,
    config: SessionConfig,
    phase: SessionPhase,

    store: PositionStore,
    channel: SyncChannel<Bus, Db>,
    graph: ProximityGraphBuilder,
    edges: ConstellationEdges,

    heartbeat: HeartbeatScheduler,
    bots: Option<BotDriver<StdRng>>,

    tx: mpsc::UnboundedSender<SessionMessage>,
    rx: mpsc::UnboundedReceiver<SessionMessage>,
    view_tx: broadcast::Sender<ViewEvent>,

    revision: u64,

    /// Spawned I/O tasks whose completion has not been handled yet
    in_flight: usize,

    /// Bot rows are deleted once every earlier write has landed
    cleanup_pending: bool,
}

impl<Ctx, Bus, Db> Session<Ctx, Bus, Db>
where
    Ctx: ConstellationContext,
    Bus: PubSubChannel,
    Db: DurableStore,
{
    pub fn new(
        context: Arc<Ctx>,
        bus: Arc<Bus>,
        db: Arc<Db>,
        self_id: ParticipantId,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, _) = broadcast::channel(VIEW_CAPACITY);

        let bots = config.bots.clone().map(|bot_config| {
            let rng = context.derive_rng(bot_config.rng_stream);
            BotDriver::new(&format!("{}-bot", self_id), bot_config, rng)
        });

        let store = PositionStore::new(self_id.clone(), context.unix_millis());
        let channel = SyncChannel::new(bus, db.clone(), config.channel_name.clone(), self_id);

        info!(
            id = %store.self_id(),
            channel = %config.channel_name,
            bots = bots.as_ref().map(|b| b.bots().len()).unwrap_or(0),
            "Session created"
        );

        Ok(Self {
            graph: ProximityGraphBuilder::from_config(&config.graph),
            heartbeat: HeartbeatScheduler::new(&config.heartbeat),
            edges: ConstellationEdges::default(),
            phase: SessionPhase::Init,
            revision: 0,
            in_flight: 0,
            cleanup_pending: false,
            context,
            db,
            config,
            store,
            channel,
            bots,
            tx,
            rx,
            view_tx,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { tx: self.tx.clone() }
    }

    pub fn self_id(&self) -> &ParticipantId {
        self.store.self_id()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn edges(&self) -> &ConstellationEdges {
        &self.edges
    }

    pub fn status(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bot_ids(&self) -> Vec<ParticipantId> {
        self.bots.as_ref().map(|b| b.ids()).unwrap_or_default()
    }

    pub fn subscribe_view(&self) -> broadcast::Receiver<ViewEvent> {
        self.view_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Direct entry points (same path as the handle)
    // ------------------------------------------------------------------

    pub fn connect(&mut self) {
        self.handle_message(SessionMessage::Connect);
    }

    pub fn disconnect(&mut self) {
        self.handle_message(SessionMessage::Disconnect);
    }

    pub fn update_position(&mut self, lat: f64, lng: f64) -> Result<(), SyncError> {
        let position = GeoPoint::new(lat, lng)?;
        self.handle_message(SessionMessage::LocalPosition(position));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Handles one message to completion.
    pub fn handle_message(&mut self, message: SessionMessage) {
        if message.is_io_completion() {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        if self.config.debug {
            debug!(
                kind = message.kind(),
                phase = ?self.phase,
                state = %self.channel.state(),
                in_flight = self.in_flight,
                "Dispatch"
            );
        }
        if self.phase == SessionPhase::Disposed && !message.is_io_completion() {
            trace!(kind = message.kind(), "Session disposed; dropping message");
            return;
        }

        match message {
            SessionMessage::LocalPosition(position) => self.on_local_position(position),
            SessionMessage::Connect => self.on_connect(),
            SessionMessage::Disconnect => self.teardown(),
            SessionMessage::Dispose => self.on_dispose(),
            SessionMessage::Channel { generation, event } => self.on_channel_event(generation, event),
            SessionMessage::Bootstrapped { generation, result } => self.on_bootstrapped(generation, result),
            SessionMessage::Subscribed { generation, result } => self.on_subscribed(generation, result),
            SessionMessage::PublishCompleted { generation, report } => {
                self.on_io_result(generation, report.is_clean());
            }
            SessionMessage::IdentityStored { generation, result } => {
                if let Err(e) = &result {
                    warn!(error = %e, "Identity upsert failed");
                }
                self.on_io_result(generation, result.is_ok());
            }
            SessionMessage::BotsCleaned(result) => match result {
                Ok(count) => debug!(count, "Bot rows removed"),
                Err(e) => warn!(error = %e, "Bot cleanup failed"),
            },
            SessionMessage::TeardownCompleted | SessionMessage::Unsubscribed => {}
        }

        if self.cleanup_pending && self.in_flight == 0 {
            self.spawn_bot_cleanup();
        }

        if self.config.debug {
            if let Err(violation) = self.store.check_invariants() {
                error!(violation = %violation, "Position store invariant violated");
            }
        }
    }

    fn on_local_position(&mut self, position: GeoPoint) {
        let now_ms = self.context.unix_millis();
        self.store.upsert_self(position, now_ms);
        self.recompute();

        if self.channel.state().is_live() {
            self.publish_self(now_ms);
        }
    }

    fn on_connect(&mut self) {
        let generation = match self.channel.begin_connect() {
            Ok(generation) => generation,
            Err(e) => {
                debug!(error = %e, "Connect ignored");
                return;
            }
        };
        self.phase = SessionPhase::Active;
        self.emit(ViewEvent::Status(ConnectionState::Connecting));

        let bootstrap = self
            .channel
            .bootstrap_task(self.config.idle_window, self.context.unix_millis());
        self.spawn_io("bootstrap", async move {
            SessionMessage::Bootstrapped {
                generation,
                result: bootstrap.await,
            }
        });
    }

    /// Bootstrap rows land before the subscription exists, so they are
    /// always applied ahead of live events.
    fn on_bootstrapped(&mut self, generation: u64, result: Result<Vec<BootstrapEntry>, EnvError>) {
        if !self.channel.is_connecting(generation) {
            debug!(generation, "Discarding stale bootstrap");
            return;
        }

        match result {
            Ok(entries) => {
                let count = entries.len();
                if self.channel.apply_bootstrap(&mut self.store, entries) {
                    self.recompute();
                }
                info!(count, "Bootstrapped from durable store");
            }
            Err(e) => warn!(error = %e, "Bootstrap failed; continuing with live events only"),
        }

        let subscribe = self.channel.subscribe_task(self.channel_handler(generation));
        self.spawn_io("subscribe", async move {
            SessionMessage::Subscribed {
                generation,
                result: subscribe.await,
            }
        });
    }

    fn on_subscribed(&mut self, generation: u64, result: Result<Subscription, EnvError>) {
        match self.channel.on_subscribed(generation, result) {
            SubscribeOutcome::Active => {
                let now = self.context.now();
                let now_ms = self.context.unix_millis();

                self.heartbeat.start(now);
                self.spawn_identity(self.store.self_id().clone(), now_ms);
                self.publish_self(now_ms);
                self.start_bots(now, now_ms);
                self.emit(ViewEvent::Status(ConnectionState::Subscribed));
            }
            SubscribeOutcome::Failed(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.emit(ViewEvent::Status(ConnectionState::Disconnected));
            }
            SubscribeOutcome::Stale(Some(subscription)) => {
                let release = self.channel.unsubscribe_task(subscription);
                self.spawn_io("unsubscribe", async move {
                    release.await;
                    SessionMessage::Unsubscribed
                });
            }
            SubscribeOutcome::Stale(None) => {}
        }
    }

    fn on_channel_event(&mut self, generation: u64, event: ChannelEvent) {
        if !self.channel.is_current(generation) {
            trace!(generation, "Discarding event from stale subscription");
            return;
        }

        let now_ms = self.context.unix_millis();
        match self.channel.on_remote_event(&mut self.store, event, now_ms) {
            Ok(RemoteOutcome::Lost(e)) => {
                info!(error = %e, "Transport closed; view cleared");
                self.stop_timers();
                self.recompute();
                self.emit(ViewEvent::Status(ConnectionState::Disconnected));
            }
            Ok(RemoteOutcome::StateChanged(state)) => self.emit(ViewEvent::Status(state)),
            Ok(outcome) if outcome.changed() => self.recompute(),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dropping invalid remote event"),
        }
    }

    fn on_io_result(&mut self, generation: u64, clean: bool) {
        if let Some(state) = self.channel.record_io_result(generation, clean) {
            self.emit(ViewEvent::Status(state));
        }
    }

    /// Stops timers, announces self offline and clears the view.
    fn teardown(&mut self) {
        self.stop_timers();
        let now_ms = self.context.unix_millis();
        if let Some(farewell) = self.channel.teardown(&mut self.store, now_ms) {
            self.spawn_io("teardown", async move {
                farewell.await;
                SessionMessage::TeardownCompleted
            });
            self.recompute();
            self.emit(ViewEvent::Status(ConnectionState::Disconnected));
        }
    }

    /// Bot rows are only deleted after outstanding publishes and identity
    /// upserts have completed; any of them landing later would restore a row.
    fn on_dispose(&mut self) {
        self.teardown();
        self.cleanup_pending = self.bots.is_some();
        self.phase = SessionPhase::Disposed;
        info!(
            id = %self.store.self_id(),
            in_flight = self.in_flight,
            "Session disposed"
        );
    }

    fn spawn_bot_cleanup(&mut self) {
        self.cleanup_pending = false;
        let db = self.db.clone();
        if let Some(bots) = self.bots.as_mut() {
            let cleanup = bots.cleanup_task(db);
            self.spawn_io("bot-cleanup", async move { SessionMessage::BotsCleaned(cleanup.await) });
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Runs whatever heartbeat and bot work is due at the context's `now()`.
    pub fn on_timer(&mut self) {
        if self.phase != SessionPhase::Active {
            return;
        }
        let now = self.context.now();
        let now_ms = self.context.unix_millis();

        let due = self.heartbeat.poll(now);
        if due.publish {
            self.publish_self(now_ms);
        }
        if due.prune {
            self.prune(now_ms);
            self.spawn_identity(self.store.self_id().clone(), now_ms);
        }

        let updates = match self.bots.as_mut() {
            Some(bots) if bots.is_running() => {
                if bots.poll(now) {
                    bots.tick(now_ms)
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        };
        self.apply_bot_updates(updates);
    }

    /// Earliest pending timer deadline, on the context's monotonic clock.
    pub fn next_deadline(&self) -> Option<Duration> {
        let bots = self.bots.as_ref().and_then(|b| b.next_deadline());
        match (self.heartbeat.next_deadline(), bots) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn stop_timers(&mut self) {
        self.heartbeat.stop();
        if let Some(bots) = self.bots.as_mut() {
            bots.stop();
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let removed = self.store.prune_stale(now_ms, self.config.idle_window);
        if !removed.is_empty() {
            info!(count = removed.len(), "Pruned stale participants");
            self.emit(ViewEvent::Pruned(removed));
            self.recompute();
        }
    }

    // ------------------------------------------------------------------
    // Bots
    // ------------------------------------------------------------------

    fn start_bots(&mut self, now: Duration, now_ms: u64) {
        let Some(bots) = self.bots.as_mut() else {
            return;
        };
        if !bots.start(now) {
            return;
        }
        let (ids, updates) = (bots.ids(), bots.updates(now_ms));
        for id in ids {
            self.spawn_identity(id, now_ms);
        }
        self.apply_bot_updates(updates);
    }

    /// Bot updates hit the local store directly and go out like any other
    /// participant's.
    fn apply_bot_updates(&mut self, updates: Vec<PositionUpdate>) {
        if updates.is_empty() {
            return;
        }
        let mut changed = false;
        for update in updates {
            changed |= self.store.upsert_other(&update).changed();
            let publish = self.channel.publish_update(update);
            self.spawn_publish(publish);
        }
        if changed {
            self.recompute();
        }
    }

    // ------------------------------------------------------------------
    // I/O plumbing
    // ------------------------------------------------------------------

    fn channel_handler(&self, generation: u64) -> ChannelHandler {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(SessionMessage::Channel { generation, event });
        })
    }

    fn publish_self(&mut self, now_ms: u64) {
        if let Some(publish) = self.channel.publish_self(&self.store, now_ms) {
            self.spawn_publish(publish);
        }
    }

    fn spawn_publish<F>(&mut self, publish: F)
    where
        F: Future<Output = PublishReport> + Send + 'static,
    {
        let generation = self.channel.generation();
        self.spawn_io("publish", async move {
            SessionMessage::PublishCompleted {
                generation,
                report: publish.await,
            }
        });
    }

    fn spawn_identity(&mut self, id: ParticipantId, now_ms: u64) {
        let generation = self.channel.generation();
        let upsert = self.channel.identity_task(id, now_ms);
        self.spawn_io("identity", async move {
            SessionMessage::IdentityStored {
                generation,
                result: upsert.await,
            }
        });
    }

    fn spawn_io<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = SessionMessage> + Send + 'static,
    {
        self.in_flight += 1;
        let tx = self.tx.clone();
        self.context.spawn(name, async move {
            let _ = tx.send(task.await);
        });
    }

    fn recompute(&mut self) {
        self.edges = self.graph.build_with(&self.store.snapshot(), &self.config.graph);
        self.revision += 1;
        self.emit(ViewEvent::Changed {
            revision: self.revision,
        });
    }

    fn emit(&self, event: ViewEvent) {
        // No receivers is fine
        let _ = self.view_tx.send(event);
    }

    // ------------------------------------------------------------------
    // Driving the loop
    // ------------------------------------------------------------------

    /// Handles every message already queued, without waiting.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Handles messages until no spawned I/O is outstanding and the queue is
    /// empty. Returns the number of messages handled.
    pub async fn settle(&mut self) -> usize {
        let mut handled = self.pump();
        while self.in_flight > 0 {
            match self.rx.recv().await {
                Some(message) => {
                    self.handle_message(message);
                    handled += 1;
                }
                None => break,
            }
            handled += self.pump();
        }
        handled
    }

    /// Disposes the session and waits for its teardown I/O.
    pub async fn dispose(&mut self) {
        self.handle_message(SessionMessage::Dispose);
        self.settle().await;
    }

    /// Runs the loop until the session is disposed and its I/O has drained.
    pub async fn run(mut self) {
        loop {
            if self.phase == SessionPhase::Disposed && self.in_flight == 0 {
                break;
            }

            let event = match self.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_sub(self.context.now());
                    tokio::select! {
                        message = self.rx.recv() => LoopEvent::Message(message),
                        _ = self.context.sleep(wait) => LoopEvent::Timer,
                    }
                }
                None => LoopEvent::Message(self.rx.recv().await),
            };

            match event {
                LoopEvent::Message(Some(message)) => self.handle_message(message),
                LoopEvent::Message(None) => break,
                LoopEvent::Timer => self.on_timer(),
            }
        }
        debug!(id = %self.store.self_id(), "Session loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::participant::LOCATION_EVENT;
    use crate::records::{to_record, LocationRecord, LOCATIONS_KEY, LOCATIONS_TABLE, USERS_KEY, USERS_TABLE};
    use crate::sled_store::SledStore;
    use async_trait::async_trait;
    use constellation_env::Filter;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Clock that only moves when told to.
    struct ManualContext {
        now: Mutex<Duration>,
    }

    impl ManualContext {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    #[async_trait]
    impl ConstellationContext for ManualContext {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_secs(1_700_000_000) + self.now()
        }

        async fn sleep(&self, _duration: Duration) {
            tokio::task::yield_now().await;
        }

        fn spawn<F>(&self, _name: &str, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }

        fn derive_rng(&self, stream: u64) -> StdRng {
            StdRng::seed_from_u64(stream)
        }

        fn seed(&self) -> u64 {
            0
        }
    }

    /// Delivers every publish to every subscriber, including the sender.
    #[derive(Default)]
    struct LoopbackBus {
        next_id: AtomicU64,
        members: Mutex<Vec<(u64, ParticipantId, ChannelHandler)>>,
    }

    impl LoopbackBus {
        fn handlers(&self) -> Vec<ChannelHandler> {
            self.members.lock().unwrap().iter().map(|(_, _, h)| h.clone()).collect()
        }
    }

    #[async_trait]
    impl PubSubChannel for LoopbackBus {
        async fn subscribe(
            &self,
            channel: &str,
            member: &ParticipantId,
            handler: ChannelHandler,
        ) -> Result<Subscription, EnvError> {
            for existing in self.handlers() {
                existing(ChannelEvent::PresenceJoin(member.clone()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.members.lock().unwrap().push((id, member.clone(), handler));
            Ok(Subscription {
                id,
                channel: channel.to_string(),
                member: member.clone(),
            })
        }

        async fn publish(&self, _channel: &str, event: &str, payload: serde_json::Value) -> Result<(), EnvError> {
            for handler in self.handlers() {
                handler(ChannelEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
            Ok(())
        }

        async fn unsubscribe(&self, subscription: Subscription) -> Result<(), EnvError> {
            let mut members = self.members.lock().unwrap();
            members.retain(|(id, _, _)| *id != subscription.id);
            for (_, _, handler) in members.iter() {
                handler(ChannelEvent::PresenceLeave(subscription.member.clone()));
            }
            Ok(())
        }
    }

    type TestSession = Session<ManualContext, LoopbackBus, SledStore>;

    struct Harness {
        ctx: Arc<ManualContext>,
        bus: Arc<LoopbackBus>,
        db: Arc<SledStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ctx: ManualContext::shared(),
                bus: Arc::new(LoopbackBus::default()),
                db: Arc::new(SledStore::open_temp().unwrap()),
            }
        }

        fn session(&self, id: &str, config: SessionConfig) -> TestSession {
            Session::new(
                self.ctx.clone(),
                self.bus.clone(),
                self.db.clone(),
                ParticipantId::from(id),
                config,
            )
            .unwrap()
        }
    }

    async fn settle_all(sessions: &mut [&mut TestSession]) {
        loop {
            let mut handled = 0;
            for session in sessions.iter_mut() {
                handled += session.settle().await;
            }
            if handled == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_subscribed_and_writes_identity() {
        let h = Harness::new();
        let mut a = h.session("alice", SessionConfig::default());
        let mut view = a.subscribe_view();

        a.connect();
        a.settle().await;

        assert_eq!(a.status(), ConnectionState::Subscribed);
        assert_eq!(a.phase(), SessionPhase::Active);
        assert_eq!(a.in_flight(), 0);
        assert_eq!(view.recv().await.unwrap(), ViewEvent::Status(ConnectionState::Connecting));
        let users = h.db.select(USERS_TABLE, &Filter::All).await.unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_two_sessions_see_each_other() {
        let h = Harness::new();
        let mut a = h.session("alice", SessionConfig::default());
        let mut b = h.session("bob", SessionConfig::default());

        a.connect();
        b.connect();
        settle_all(&mut [&mut a, &mut b]).await;

        a.update_position(44.4268, 26.1025).unwrap();
        b.update_position(44.4278, 26.1035).unwrap();
        settle_all(&mut [&mut a, &mut b]).await;

        let seen = a.snapshot();
        let bob = seen.get(&ParticipantId::from("bob")).unwrap();
        assert!(bob.is_placeable());
        assert_eq!(a.edges().primary.len(), 1);
        assert_eq!(a.edges().primary[0].to.as_str(), "bob");
        assert_eq!(b.edges().primary[0].to.as_str(), "alice");
        // Own echo never enters the remote map
        assert!(a.snapshot().others.iter().all(|p| p.id.as_str() != "alice"));
    }

    #[tokio::test]
    async fn test_late_joiner_bootstraps_from_store() {
        let h = Harness::new();
        let now_ms = h.ctx.unix_millis();
        let update = PositionUpdate::new(
            ParticipantId::from("early"),
            GeoPoint::new(44.4268, 26.1025).unwrap(),
            now_ms,
        );
        let row = to_record(&LocationRecord::from_update(&update)).unwrap();
        h.db.upsert(LOCATIONS_TABLE, row, LOCATIONS_KEY).await.unwrap();

        let mut late = h.session("late", SessionConfig::default());
        late.connect();
        late.settle().await;

        assert!(late.snapshot().get(&ParticipantId::from("early")).is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_and_prunes() {
        let h = Harness::new();
        let config = SessionConfig {
            idle_window: Duration::from_secs(20),
            ..SessionConfig::default()
        };
        let mut a = h.session("alice", config.clone());
        let mut b = h.session("bob", config);
        a.connect();
        b.connect();
        settle_all(&mut [&mut a, &mut b]).await;
        a.update_position(1.0, 1.0).unwrap();
        settle_all(&mut [&mut a, &mut b]).await;
        assert_eq!(b.snapshot().others.len(), 1);

        let mut view = b.subscribe_view();
        // Alice goes quiet; only Bob's timers run
        for _ in 0..10 {
            h.ctx.advance(Duration::from_secs(4));
            b.on_timer();
            b.settle().await;
        }

        assert!(b.snapshot().others.is_empty());
        let mut pruned = Vec::new();
        while let Ok(event) = view.try_recv() {
            if let ViewEvent::Pruned(ids) = event {
                pruned.extend(ids);
            }
        }
        assert_eq!(pruned, vec![ParticipantId::from("alice")]);
    }

    #[tokio::test]
    async fn test_disconnect_discards_in_flight_completions() {
        let h = Harness::new();
        let mut a = h.session("alice", SessionConfig::default());

        a.connect();
        a.disconnect();
        a.settle().await;

        assert_eq!(a.status(), ConnectionState::Disconnected);
        assert_eq!(a.in_flight(), 0);
        assert!(h.bus.members.lock().unwrap().is_empty());
        assert_eq!(a.next_deadline(), None);

        // Reconnect works after the aborted attempt
        a.connect();
        a.settle().await;
        assert_eq!(a.status(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_disconnect_clears_view_and_departs() {
        let h = Harness::new();
        let mut a = h.session("alice", SessionConfig::default());
        let mut b = h.session("bob", SessionConfig::default());
        a.connect();
        b.connect();
        a.update_position(1.0, 1.0).unwrap();
        b.update_position(1.0, 1.001).unwrap();
        settle_all(&mut [&mut a, &mut b]).await;
        assert_eq!(b.snapshot().others.len(), 1);

        a.disconnect();
        settle_all(&mut [&mut a, &mut b]).await;

        assert!(a.snapshot().others.is_empty());
        assert!(a.edges().is_empty());
        assert!(b.snapshot().others.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_remote_payload_is_dropped() {
        let h = Harness::new();
        let mut a = h.session("alice", SessionConfig { debug: true, ..SessionConfig::default() });
        a.connect();
        a.settle().await;
        let revision = a.revision();

        h.bus
            .publish("constellation", LOCATION_EVENT, serde_json::json!({"lat": "north"}))
            .await
            .unwrap();
        a.settle().await;

        assert!(a.snapshot().others.is_empty());
        assert_eq!(a.revision(), revision);
        assert_eq!(a.status(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_bots_move_and_are_cleaned_up() {
        let h = Harness::new();
        let config = SessionConfig {
            bots: Some(BotConfig {
                count: 3,
                ..BotConfig::default()
            }),
            ..SessionConfig::default()
        };
        let mut host = h.session("host", config);
        host.connect();
        host.settle().await;

        let bots = host.bot_ids();
        assert_eq!(bots.len(), 3);
        assert_eq!(host.snapshot().others.len(), 3);
        let before = host.snapshot();

        h.ctx.advance(Duration::from_secs(2));
        host.on_timer();
        host.settle().await;
        assert_ne!(host.snapshot().others, before.others);

        host.dispose().await;

        assert_eq!(host.phase(), SessionPhase::Disposed);
        assert!(host.bot_ids().is_empty());
        for id in &bots {
            let filter = Filter::eq(LOCATIONS_KEY, id.as_str());
            assert!(h.db.select(LOCATIONS_TABLE, &filter).await.unwrap().is_empty());
        }
        let users = h.db.select(USERS_TABLE, &Filter::All).await.unwrap();
        assert_eq!(users.len(), 1, "only the host identity remains");
    }

    /// Loopback delivery that yields several times before broadcasting, so
    /// publishes are still pending when the session moves on.
    #[derive(Default)]
    struct YieldingBus {
        inner: LoopbackBus,
    }

    #[async_trait]
    impl PubSubChannel for YieldingBus {
        async fn subscribe(
            &self,
            channel: &str,
            member: &ParticipantId,
            handler: ChannelHandler,
        ) -> Result<Subscription, EnvError> {
            self.inner.subscribe(channel, member, handler).await
        }

        async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<(), EnvError> {
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            self.inner.publish(channel, event, payload).await
        }

        async fn unsubscribe(&self, subscription: Subscription) -> Result<(), EnvError> {
            self.inner.unsubscribe(subscription).await
        }
    }

    #[tokio::test]
    async fn test_dispose_waits_for_pending_bot_publishes() {
        let ctx = ManualContext::shared();
        let db = Arc::new(SledStore::open_temp().unwrap());
        let config = SessionConfig {
            bots: Some(BotConfig {
                count: 3,
                ..BotConfig::default()
            }),
            ..SessionConfig::default()
        };
        let mut host = Session::new(
            ctx.clone(),
            Arc::new(YieldingBus::default()),
            db.clone(),
            ParticipantId::from("host"),
            config,
        )
        .unwrap();
        host.connect();
        host.settle().await;
        let bots = host.bot_ids();

        // Bot tick leaves three publishes in flight
        ctx.advance(Duration::from_secs(2));
        host.on_timer();
        assert!(host.in_flight() >= 3);
        host.dispose().await;

        assert_eq!(host.in_flight(), 0);
        let ids: Vec<serde_json::Value> = bots.iter().map(|id| id.as_str().into()).collect();
        let locations = db
            .select(LOCATIONS_TABLE, &Filter::any_of(LOCATIONS_KEY, ids.clone()))
            .await
            .unwrap();
        assert!(locations.is_empty(), "bot rows survived cleanup: {}", locations.len());
        let users = db.select(USERS_TABLE, &Filter::any_of(USERS_KEY, ids)).await.unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_handle_rejects_invalid_position_and_closed_session() {
        let h = Harness::new();
        let session = h.session("alice", SessionConfig::default());
        let handle = session.handle();

        assert!(matches!(handle.update_position(95.0, 0.0), Err(SyncError::InvalidPayload(_))));
        assert!(handle.update_position(45.0, 0.0).is_ok());

        drop(session);
        assert_eq!(handle.connect(), Err(SyncError::SessionClosed));
    }

    #[tokio::test]
    async fn test_run_exits_after_dispose() {
        let h = Harness::new();
        let session = h.session("alice", SessionConfig::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        handle.connect().unwrap();
        handle.update_position(1.0, 1.0).unwrap();
        handle.dispose().unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop did not exit")
            .unwrap();
    }
}
