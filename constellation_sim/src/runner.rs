//! Scenario runner - executes fault-injection scenarios against a SimWorld.

use crate::exporter::{SimExport, SimFrame};
use crate::network::BusStats;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};
use constellation_core::records::{LOCATIONS_TABLE, USERS_TABLE};
use constellation_core::{distance_m, BotConfig, ConnectionState, SyncError};
use constellation_env::{ChannelController, ConstellationContext, ParticipantId};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Idle window used by the stale-eviction scenario.
const SHORT_IDLE_WINDOW: Duration = Duration::from_secs(20);

/// Bots hosted in the bot-swarm scenario unless the config sets its own.
const SWARM_BOTS: usize = 8;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Scenario setup failed: {0}")]
    Setup(#[from] SyncError),
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Every failed assertion, in order
    pub failures: Vec<String>,

    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    pub fn failure_reason(&self) -> Option<String> {
        (!self.failures.is_empty()).then(|| self.failures.join("; "))
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub participants: usize,
    pub steps: u64,
    pub messages_handled: usize,
    pub view_changes: usize,
    pub pruned: usize,

    /// Divergences from ground truth at the end of the run
    pub divergences: usize,

    pub primary_edges: usize,
    pub secondary_edges: usize,
    pub bus: BusStats,
    pub location_rows: usize,
    pub user_rows: usize,
}

#[derive(Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn expect(&mut self, ok: bool, describe: impl FnOnce() -> String) {
        if !ok {
            let failure = describe();
            warn!(failure = %failure, "Check failed");
            self.failures.push(failure);
        }
    }

    fn expect_converged(&mut self, world: &SimWorld, phase: &str) {
        let divergences = world.divergences();
        self.expect(divergences.is_empty(), || {
            format!(
                "{}: {} divergences (first: {:?})",
                phase,
                divergences.len(),
                divergences.first()
            )
        });
    }
}

/// Runs scenarios.
pub struct ScenarioRunner {
    config: SimConfig,
}

impl ScenarioRunner {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn with_participants(mut self, participants: usize) -> Self {
        self.config.participants = participants;
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.config.duration_secs = secs;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario on a fresh single-threaded runtime.
    ///
    /// Must not be called from inside another tokio runtime.
    pub fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult, ScenarioError> {
        let (result, _) = self.block_on(scenario, false)?;
        Ok(result)
    }

    /// Runs a scenario and returns its frame-by-frame export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> Result<(ScenarioResult, SimExport), ScenarioError> {
        let (result, frames) = self.block_on(scenario, true)?;
        let mut export = SimExport::new(scenario.name(), self.config.seed);
        for frame in frames {
            export.add_frame(frame);
        }
        export.finalize(result.passed);
        Ok((result, export))
    }

    /// Runs `scenario` once per seed.
    pub fn run_seeds(&self, scenario: ScenarioId, seeds: &[u64]) -> Result<Vec<ScenarioResult>, ScenarioError> {
        seeds
            .iter()
            .map(|&seed| Self::new(self.config.clone()).with_seed(seed).run(scenario))
            .collect()
    }

    fn block_on(&self, scenario: ScenarioId, record: bool) -> Result<(ScenarioResult, Vec<SimFrame>), ScenarioError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        runtime.block_on(self.execute(scenario, record))
    }

    /// Runs a scenario on the current runtime.
    pub async fn execute(
        &self,
        scenario: ScenarioId,
        record: bool,
    ) -> Result<(ScenarioResult, Vec<SimFrame>), ScenarioError> {
        info!(scenario = %scenario, seed = self.config.seed, "Starting scenario");

        let mut world = SimWorld::new(self.config.clone());
        if record {
            world.start_recording();
        }

        let mut checks = Checks::default();
        match scenario {
            ScenarioId::Rendezvous => self.run_rendezvous(&mut world, &mut checks).await?,
            ScenarioId::LateJoiner => self.run_late_joiner(&mut world, &mut checks).await?,
            ScenarioId::FlakyNetwork => self.run_flaky_network(&mut world, &mut checks).await?,
            ScenarioId::BotSwarm => self.run_bot_swarm(&mut world, &mut checks).await?,
            ScenarioId::StaleEviction => self.run_stale_eviction(&mut world, &mut checks).await?,
            ScenarioId::Reconnect => self.run_reconnect(&mut world, &mut checks).await?,
        }

        let result = Self::finish(scenario, &world, checks);
        if result.passed {
            info!(scenario = %scenario, steps = result.metrics.steps, "Scenario passed");
        } else {
            warn!(scenario = %scenario, failures = result.failures.len(), "Scenario failed");
        }
        Ok((result, world.take_frames()))
    }

    fn participants(&self) -> usize {
        self.config.participants.max(2)
    }

    /// Configured run length, never shorter than `recovery()`.
    fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.config.duration_secs.max(0.0)).max(self.recovery())
    }

    /// Enough time for every participant to heartbeat at least twice.
    fn recovery(&self) -> Duration {
        self.config.session.heartbeat.publish_interval * 2 + Duration::from_secs(1)
    }

    /// Walkers connect on a clean network and every view matches the truth.
    async fn run_rendezvous(&self, world: &mut SimWorld, checks: &mut Checks) -> Result<(), ScenarioError> {
        world.spawn_participants(self.participants(), true)?;
        world.connect_all();
        world.run_for(self.duration()).await;
        checks.expect_converged(world, "after walking");

        // With converged views, each primary set is the k nearest within range
        let graph = &world.config.session.graph;
        let truth = world.truth();
        for id in world.ids() {
            let (Some(session), Some(origin)) = (world.session(&id), truth.get(&id)) else {
                continue;
            };
            let in_range = truth
                .iter()
                .filter(|(other, at)| *other != &id && distance_m(origin, at) < graph.max_distance_m)
                .count();
            let expected = in_range.min(graph.max_connections);
            let actual = session.edges().primary.len();
            checks.expect(actual == expected, || {
                format!("{}: {} primary edges, expected {}", id, actual, expected)
            });
        }
        Ok(())
    }

    /// A late participant sees everyone from bootstrap, before any live traffic.
    async fn run_late_joiner(&self, world: &mut SimWorld, checks: &mut Checks) -> Result<(), ScenarioError> {
        world.spawn_participants(self.participants() - 1, true)?;
        world.connect_all();
        world.run_for(self.duration() / 2).await;

        let start = world.random_point();
        let late = world.spawn_participant(Some(start), self.config.session.clone())?;
        world.connect(&late);
        world.settle_all().await;

        let missing: Vec<_> = world
            .divergences()
            .into_iter()
            .filter(|d| d.observer == late)
            .collect();
        checks.expect(missing.is_empty(), || {
            format!("late joiner missing {} participants after bootstrap", missing.len())
        });

        world.run_for(self.recovery()).await;
        checks.expect_converged(world, "after late join");
        Ok(())
    }

    /// Faults everywhere, then a calm period in which views must recover.
    async fn run_flaky_network(&self, world: &mut SimWorld, checks: &mut Checks) -> Result<(), ScenarioError> {
        world.spawn_participants(self.participants(), true)?;
        world.connect_all();
        world.settle_all().await;

        world.controller.set_loss_rate(0.3);
        world.controller.set_duplicate_rate(0.2);
        world.controller.set_reorder_rate(0.2);
        world.controller.set_publish_failure_rate(0.1);
        world.store.set_write_failure_rate(0.1);
        world.store.set_read_failure_rate(0.1);
        world.run_for(self.duration()).await;

        let stats = world.controller.stats();
        checks.expect(stats.dropped > 0 && stats.duplicated > 0, || {
            format!("faults never fired: {:?}", stats)
        });

        world.controller.calm();
        world.store.set_write_failure_rate(0.0);
        world.store.set_read_failure_rate(0.0);
        world.controller.release_held();
        world.run_for(self.recovery()).await;

        checks.expect_converged(world, "after recovery");
        for id in world.ids() {
            let status = world.session(&id).map(|s| s.status());
            checks.expect(status == Some(ConnectionState::Subscribed), || {
                format!("{} ended {:?}", id, status)
            });
        }
        Ok(())
    }

    /// One host drives bots; observers track them; dispose removes every bot row.
    async fn run_bot_swarm(&self, world: &mut SimWorld, checks: &mut Checks) -> Result<(), ScenarioError> {
        let mut host_config = self.config.session.clone();
        host_config.bots.get_or_insert_with(|| BotConfig {
            count: SWARM_BOTS,
            ..BotConfig::default()
        });
        let bounds = host_config.bots.as_ref().map(|b| b.bounds).unwrap_or_default();

        let center = world.config.area.center();
        let host = world.spawn_participant(Some(center), host_config)?;

        let mut observer_config = self.config.session.clone();
        observer_config.bots = None;
        for _ in 1..self.participants() {
            let at = world.random_point();
            world.spawn_participant(Some(at), observer_config.clone())?;
        }

        world.connect_all();
        world.run_for(self.duration()).await;
        checks.expect_converged(world, "bots tracked");

        let bot_ids: Vec<ParticipantId> = world.session(&host).map(|s| s.bot_ids()).unwrap_or_default();
        let truth = world.truth();
        for bot in &bot_ids {
            let inside = truth.get(bot).map(|p| bounds.contains(p)).unwrap_or(false);
            checks.expect(inside, || format!("bot {} missing or out of bounds", bot));
        }

        world.dispose(&host).await;
        let orphans = bot_ids
            .iter()
            .filter(|bot| {
                world.store.get(LOCATIONS_TABLE, bot.as_str()).is_some()
                    || world.store.get(USERS_TABLE, bot.as_str()).is_some()
            })
            .count();
        checks.expect(orphans == 0, || format!("{} bots left durable rows", orphans));
        Ok(())
    }

    /// A partitioned participant is evicted after the idle window and
    /// rediscovered once the partition heals.
    async fn run_stale_eviction(&self, world: &mut SimWorld, checks: &mut Checks) -> Result<(), ScenarioError> {
        world.config.session.idle_window = SHORT_IDLE_WINDOW;
        let ids = world.spawn_participants(self.participants(), false)?;
        world.connect_all();
        world.run_for(Duration::from_secs(5)).await;
        checks.expect_converged(world, "before partition");

        let (rest, isolated) = ids.split_at(ids.len() - 1);
        let isolated = isolated[0].clone();
        world.partition(&[isolated.clone()], rest);

        let prune_interval = world.config.session.heartbeat.prune_interval;
        world
            .run_for(SHORT_IDLE_WINDOW + prune_interval + Duration::from_secs(1))
            .await;

        for id in rest {
            let still_there = world
                .session(id)
                .map(|s| s.snapshot().get(&isolated).is_some())
                .unwrap_or(false);
            checks.expect(!still_there, || format!("{} never pruned {}", id, isolated));
        }
        let isolated_sees = world.session(&isolated).map(|s| s.snapshot().others.len()).unwrap_or(0);
        checks.expect(isolated_sees == 0, || {
            format!("isolated participant still sees {} others", isolated_sees)
        });

        world.heal();
        world.run_for(self.recovery()).await;
        checks.expect_converged(world, "after heal");
        Ok(())
    }

    /// A dropped connection clears the view; reconnecting restores it.
    async fn run_reconnect(&self, world: &mut SimWorld, checks: &mut Checks) -> Result<(), ScenarioError> {
        let ids = world.spawn_participants(self.participants(), true)?;
        world.connect_all();
        world.run_for(Duration::from_secs(5)).await;

        let target = ids[0].clone();
        world.drop_connection(&target);
        world.step().await;

        let (status, others) = world
            .session(&target)
            .map(|s| (s.status(), s.snapshot().others.len()))
            .unwrap_or((ConnectionState::Disconnected, 0));
        checks.expect(status == ConnectionState::Disconnected, || {
            format!("dropped participant is {}", status)
        });
        checks.expect(others == 0, || format!("dropped participant still sees {} others", others));
        for id in &ids[1..] {
            let sees_target = world
                .session(id)
                .map(|s| s.snapshot().get(&target).is_some())
                .unwrap_or(false);
            checks.expect(!sees_target, || format!("{} still shows departed {}", id, target));
        }

        world.connect(&target);
        world.settle_all().await;
        world.run_for(self.recovery()).await;
        checks.expect_converged(world, "after reconnect");
        Ok(())
    }

    fn finish(scenario: ScenarioId, world: &SimWorld, checks: Checks) -> ScenarioResult {
        let stats = world.stats();
        let ids = world.ids();
        let (primary_edges, secondary_edges) = ids
            .iter()
            .filter_map(|id| world.session(id))
            .fold((0, 0), |(p, s), session| {
                (p + session.edges().primary.len(), s + session.edges().secondary.len())
            });

        let metrics = ScenarioMetrics {
            participants: ids.len(),
            steps: stats.steps,
            messages_handled: stats.messages_handled,
            view_changes: stats.view_changes,
            pruned: stats.pruned,
            divergences: world.divergences().len(),
            primary_edges,
            secondary_edges,
            bus: world.controller.stats(),
            location_rows: world.store.row_count(LOCATIONS_TABLE),
            user_rows: world.store.row_count(USERS_TABLE),
        };

        ScenarioResult {
            scenario,
            seed: world.config.seed,
            passed: checks.failures.is_empty(),
            final_time_secs: world.context.now().as_secs_f64(),
            failures: checks.failures,
            metrics,
        }
    }
}
