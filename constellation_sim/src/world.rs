//! SimWorld - The simulation harness container.
//!
//! Owns the virtual clock, the shared bus and store, and one `Session` per
//! participant. Every step advances time, moves the walkers, fires due
//! timers and then drains every session until no message or I/O is left.

use crate::context::SimContext;
use crate::exporter::{SimEvent, SimFrame, ViewFrame};
use crate::network::{BusController, MemoryBus};
use crate::storage::MemoryStore;
use constellation_core::{
    BoundingBox, GeoPoint, Session, SessionConfig, SessionPhase, SyncError, ViewEvent,
};
use constellation_env::{ChannelController, ConstellationContext, ParticipantId};
use nalgebra::{Rotation2, Vector2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

pub type SimSession = Session<SimContext, MemoryBus, MemoryStore>;

const METERS_PER_DEGREE: f64 = 111_320.0;

/// Upper bound on settle passes per step; a healthy world needs two or three.
const MAX_SETTLE_ROUNDS: usize = 64;

/// Walkers turn by at most this much per second (radians).
const WANDER_TURN_RATE: f64 = 0.3;

/// Configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of participants to spawn
    pub participants: usize,

    /// Steps per simulated second
    pub tick_rate_hz: u32,

    /// Scenario run length in seconds
    pub duration_secs: f64,

    /// Walking speed of wandering participants
    pub wander_speed_mps: f64,

    /// Participants spawn within this distance of the area center
    pub spawn_radius_m: f64,

    /// Area participants wander in
    pub area: BoundingBox,

    /// Configuration handed to every session
    pub session: SessionConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            participants: 5,
            tick_rate_hz: 4,
            duration_secs: 60.0,
            wander_speed_mps: 1.4,
            spawn_radius_m: 300.0,
            area: BoundingBox::default(),
            session: SessionConfig::default(),
        }
    }
}

impl SimConfig {
    /// Length of one step.
    pub fn step(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

/// A participant that moves on its own between steps.
#[derive(Debug, Clone)]
struct Walker {
    /// (x = longitude, y = latitude) in degrees
    position: Vector2<f64>,

    /// Degrees per second
    velocity: Vector2<f64>,
}

impl Walker {
    fn new(start: GeoPoint, speed_mps: f64, rng: &mut ChaCha8Rng) -> Self {
        let heading = rng.gen_range(0.0..TAU);
        Self {
            position: Vector2::new(start.lng, start.lat),
            velocity: Vector2::new(heading.cos(), heading.sin()) * (speed_mps / METERS_PER_DEGREE),
        }
    }

    fn advance(&mut self, dt: f64, area: &BoundingBox, rng: &mut ChaCha8Rng) {
        let max_turn = WANDER_TURN_RATE * dt;
        if max_turn > 0.0 {
            self.velocity = Rotation2::new(rng.gen_range(-max_turn..=max_turn)) * self.velocity;
        }
        self.position += self.velocity * dt;

        if self.position.x < area.min_lng || self.position.x > area.max_lng {
            self.velocity.x = -self.velocity.x;
            self.position.x = self.position.x.clamp(area.min_lng, area.max_lng);
        }
        if self.position.y < area.min_lat || self.position.y > area.max_lat {
            self.velocity.y = -self.velocity.y;
            self.position.y = self.position.y.clamp(area.min_lat, area.max_lat);
        }
    }

    fn location(&self) -> GeoPoint {
        GeoPoint {
            lat: self.position.y,
            lng: self.position.x,
        }
    }
}

/// How an observer's view disagrees with ground truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergenceKind {
    Missing,
    Offline,
    Moved { error_m: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Divergence {
    pub observer: ParticipantId,
    pub subject: ParticipantId,
    #[serde(flatten)]
    pub kind: DivergenceKind,
}

/// Counters accumulated across steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorldStats {
    pub steps: u64,
    pub messages_handled: usize,
    pub view_changes: usize,
    pub pruned: usize,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Bus fault injection
    pub controller: BusController,

    /// Durable store shared by every session
    pub store: Arc<MemoryStore>,

    sessions: BTreeMap<ParticipantId, SimSession>,
    views: BTreeMap<ParticipantId, broadcast::Receiver<ViewEvent>>,
    walkers: BTreeMap<ParticipantId, Walker>,
    rng: ChaCha8Rng,
    next_index: u64,
    stats: WorldStats,
    pending_events: Vec<SimEvent>,
    frames: Option<Vec<SimFrame>>,
}

impl SimWorld {
    pub fn new(config: SimConfig) -> Self {
        // Separate seeds per subsystem
        let bus_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let store_seed = config.seed.wrapping_mul(0x517cc1b727220a95);
        let world_seed = config.seed ^ 0xc0ffee;

        Self {
            context: SimContext::shared(config.seed),
            controller: BusController::new(bus_seed),
            store: Arc::new(MemoryStore::new(store_seed)),
            sessions: BTreeMap::new(),
            views: BTreeMap::new(),
            walkers: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(world_seed),
            next_index: 0,
            stats: WorldStats::default(),
            pending_events: Vec::new(),
            frames: None,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------

    /// Creates a session (not yet connected), optionally already positioned.
    pub fn spawn_participant(
        &mut self,
        position: Option<GeoPoint>,
        mut session_config: SessionConfig,
    ) -> Result<ParticipantId, SyncError> {
        let index = self.next_index;
        self.next_index += 1;

        // Each host's bots get their own stream
        if let Some(bots) = session_config.bots.as_mut() {
            bots.rng_stream ^= index;
        }

        let id = ParticipantId::from_seed(self.config.seed.wrapping_add(index));
        let bus = Arc::new(self.controller.endpoint(id.clone()));
        let mut session = Session::new(
            self.context.clone(),
            bus,
            self.store.clone(),
            id.clone(),
            session_config,
        )?;
        if let Some(p) = position {
            session.update_position(p.lat, p.lng)?;
        }

        debug!(id = %id, index, "Spawned participant");
        self.views.insert(id.clone(), session.subscribe_view());
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    /// Spawns `count` participants at random points near the area center,
    /// each walking if `wander` is set.
    pub fn spawn_participants(&mut self, count: usize, wander: bool) -> Result<Vec<ParticipantId>, SyncError> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let start = self.random_point();
            let id = self.spawn_participant(Some(start), self.config.session.clone())?;
            if wander {
                self.walkers
                    .insert(id.clone(), Walker::new(start, self.config.wander_speed_mps, &mut self.rng));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Uniform point within `spawn_radius_m` of the area center, inside the area.
    pub fn random_point(&mut self) -> GeoPoint {
        let center = self.config.area.center();
        let angle = self.rng.gen_range(0.0..TAU);
        let distance = self.config.spawn_radius_m * self.rng.gen::<f64>().sqrt();

        let dlat = distance * angle.sin() / METERS_PER_DEGREE;
        let dlng = distance * angle.cos() / (METERS_PER_DEGREE * center.lat.to_radians().cos());
        let area = &self.config.area;
        GeoPoint {
            lat: (center.lat + dlat).clamp(area.min_lat, area.max_lat),
            lng: (center.lng + dlng).clamp(area.min_lng, area.max_lng),
        }
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn session(&self, id: &ParticipantId) -> Option<&SimSession> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &ParticipantId) -> Option<&mut SimSession> {
        self.sessions.get_mut(id)
    }

    pub fn stats(&self) -> WorldStats {
        self.stats
    }

    // ------------------------------------------------------------------
    // Lifecycle and faults
    // ------------------------------------------------------------------

    pub fn connect(&mut self, id: &ParticipantId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.connect();
            self.note(format!("{} connect", id));
        }
    }

    pub fn connect_all(&mut self) {
        for id in self.ids() {
            self.connect(&id);
        }
    }

    /// Orderly disconnect requested by the participant.
    pub fn disconnect(&mut self, id: &ParticipantId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.disconnect();
            self.note(format!("{} disconnect", id));
        }
    }

    /// Transport-side connection drop.
    pub fn drop_connection(&mut self, id: &ParticipantId) {
        self.controller.disconnect(id);
        self.note(format!("{} connection dropped", id));
    }

    pub fn partition(&mut self, group_a: &[ParticipantId], group_b: &[ParticipantId]) {
        self.controller.partition(group_a, group_b);
        self.note(format!("partition {} | {}", group_a.len(), group_b.len()));
    }

    pub fn heal(&mut self) {
        self.controller.heal_all();
        self.note("partitions healed".to_string());
    }

    /// Disposes a session, waits for its teardown I/O and stops its walker.
    pub async fn dispose(&mut self, id: &ParticipantId) {
        self.walkers.remove(id);
        if let Some(session) = self.sessions.get_mut(id) {
            session.dispose().await;
            self.note(format!("{} disposed", id));
        }
        self.stats.messages_handled += self.settle_all().await;
    }

    /// Moves a participant's local position (and its walker, if any).
    pub fn move_participant(&mut self, id: &ParticipantId, position: GeoPoint) -> Result<(), SyncError> {
        if let Some(walker) = self.walkers.get_mut(id) {
            walker.position = Vector2::new(position.lng, position.lat);
        }
        match self.sessions.get_mut(id) {
            Some(session) => session.update_position(position.lat, position.lng),
            None => Err(SyncError::SessionClosed),
        }
    }

    fn note(&mut self, message: String) {
        info!(event = %message, "Sim event");
        self.pending_events.push(SimEvent { message });
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    /// Drives every session until a full pass handles nothing.
    pub async fn settle_all(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut handled = 0;
            for session in self.sessions.values_mut() {
                handled += session.settle().await;
            }
            total += handled;
            if handled == 0 {
                return total;
            }
        }
        warn!(rounds = MAX_SETTLE_ROUNDS, "World did not settle");
        total
    }

    /// One step of `config.step()`.
    pub async fn step(&mut self) -> usize {
        let dt = self.config.step();
        self.step_by(dt).await
    }

    pub async fn step_by(&mut self, dt: Duration) -> usize {
        self.context.advance_time(dt);
        self.stats.steps += 1;

        self.move_walkers(dt.as_secs_f64());
        self.controller.release_held();
        for session in self.sessions.values_mut() {
            session.on_timer();
        }

        let handled = self.settle_all().await;
        self.stats.messages_handled += handled;
        self.drain_view_events();

        let events = std::mem::take(&mut self.pending_events);
        if self.frames.is_some() {
            let mut frame = self.capture_frame();
            frame.events = events;
            if let Some(frames) = self.frames.as_mut() {
                frames.push(frame);
            }
        }
        handled
    }

    /// Steps until `duration` of virtual time has passed.
    pub async fn run_for(&mut self, duration: Duration) {
        let step = self.config.step();
        let steps = (duration.as_secs_f64() / step.as_secs_f64()).ceil() as u64;
        for _ in 0..steps {
            self.step_by(step).await;
        }
    }

    fn move_walkers(&mut self, dt: f64) {
        let area = self.config.area;
        for (id, walker) in self.walkers.iter_mut() {
            walker.advance(dt, &area, &mut self.rng);
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            if session.phase() == SessionPhase::Disposed {
                continue;
            }
            let at = walker.location();
            if let Err(e) = session.update_position(at.lat, at.lng) {
                warn!(id = %id, error = %e, "Walker left the valid coordinate range");
            }
        }
    }

    fn drain_view_events(&mut self) {
        for (id, rx) in self.views.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(ViewEvent::Changed { .. }) => self.stats.view_changes += 1,
                    Ok(ViewEvent::Pruned(ids)) => {
                        self.stats.pruned += ids.len();
                        self.pending_events.push(SimEvent {
                            message: format!("{} pruned {}", id, ids.len()),
                        });
                    }
                    Ok(ViewEvent::Status(state)) => debug!(id = %id, state = %state, "Status"),
                    Err(TryRecvError::Lagged(skipped)) => debug!(id = %id, skipped, "View receiver lagged"),
                    Err(_) => break,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn start_recording(&mut self) {
        self.frames.get_or_insert_with(Vec::new);
    }

    pub fn take_frames(&mut self) -> Vec<SimFrame> {
        self.frames.take().unwrap_or_default()
    }

    pub fn capture_frame(&self) -> SimFrame {
        let views = self
            .sessions
            .iter()
            .map(|(id, s)| ViewFrame::capture(id, s.status(), &s.snapshot(), s.edges()))
            .collect();
        SimFrame {
            step: self.stats.steps,
            time_sec: self.context.now().as_secs_f64(),
            views,
            events: Vec::new(),
        }
    }

    /// Where every live participant (and each live host's bots) really is.
    pub fn truth(&self) -> BTreeMap<ParticipantId, GeoPoint> {
        let mut truth = BTreeMap::new();
        for (id, session) in &self.sessions {
            if !session.status().is_live() {
                continue;
            }
            let snapshot = session.snapshot();
            if let Some(position) = snapshot.self_participant.position {
                truth.insert(id.clone(), position);
            }
            for bot in session.bot_ids() {
                if let Some(position) = snapshot.get(&bot).and_then(|p| p.position) {
                    truth.insert(bot, position);
                }
            }
        }
        truth
    }

    /// Every disagreement between a live observer's view and the truth.
    pub fn divergences(&self) -> Vec<Divergence> {
        let truth = self.truth();
        let mut out = Vec::new();
        for (observer, session) in &self.sessions {
            if !session.status().is_live() {
                continue;
            }
            let snapshot = session.snapshot();
            for (subject, actual) in &truth {
                if subject == observer {
                    continue;
                }
                let kind = match snapshot.get(subject) {
                    None => Some(DivergenceKind::Missing),
                    Some(p) if !p.online => Some(DivergenceKind::Offline),
                    Some(p) => match p.position {
                        None => Some(DivergenceKind::Missing),
                        Some(seen) => {
                            let error_m = seen.distance_m(actual);
                            (error_m > 0.01).then_some(DivergenceKind::Moved { error_m })
                        }
                    },
                };
                if let Some(kind) = kind {
                    out.push(Divergence {
                        observer: observer.clone(),
                        subject: subject.clone(),
                        kind,
                    });
                }
            }
        }
        out
    }

    pub fn converged(&self) -> bool {
        self.divergences().is_empty()
    }
}
