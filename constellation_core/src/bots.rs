//! Simulated agents ("bots") that wander inside a bounding box.
//!
//! Bots publish through the same path as real participants, so nothing
//! downstream can tell them apart. All randomness comes from the injected
//! `Rng`, so a seeded generator reproduces trajectories exactly.

use constellation_env::{DurableStore, Filter, ParticipantId};
use nalgebra::Vector2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::f64::consts::{PI, TAU};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use crate::config::BotConfig;
use crate::error::SyncError;
use crate::geomath::GeoPoint;
use crate::heartbeat::PeriodicTimer;
use crate::participant::PositionUpdate;
use crate::records::{LOCATIONS_KEY, LOCATIONS_TABLE, USERS_KEY, USERS_TABLE};

/// Axis-aligned lat/lng rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Default for BoundingBox {
    fn default() -> Self {
        // Central Bucharest, roughly 1.6km x 1.2km
        Self {
            min_lat: 44.4200,
            max_lat: 44.4350,
            min_lng: 26.0950,
            max_lng: 26.1100,
        }
    }
}

impl BoundingBox {
    pub fn validate(&self) -> Result<(), SyncError> {
        for (lat, lng) in [(self.min_lat, self.min_lng), (self.max_lat, self.max_lng)] {
            GeoPoint::new(lat, lng).map_err(|e| SyncError::InvalidConfig(format!("bounds: {}", e)))?;
        }
        if self.min_lat > self.max_lat || self.min_lng > self.max_lng {
            return Err(SyncError::InvalidConfig("bounding box corners are inverted".into()));
        }
        Ok(())
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lng: (self.min_lng + self.max_lng) / 2.0,
        }
    }
}

/// One synthetic participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Bot {
    pub id: ParticipantId,

    /// (x = longitude, y = latitude) in degrees
    pub position: Vector2<f64>,

    /// Radians, 0 = east, π/2 = north
    pub heading: f64,

    /// Degrees per tick
    pub speed: f64,
}

impl Bot {
    pub fn location(&self) -> GeoPoint {
        GeoPoint {
            lat: self.position.y,
            lng: self.position.x,
        }
    }
}

/// Owns the bots, their movement timer and their random source.
pub struct BotDriver<R: Rng> {
    config: BotConfig,
    bots: Vec<Bot>,
    rng: R,
    timer: PeriodicTimer,
}

impl<R: Rng> BotDriver<R> {
    /// Spawns `config.count` bots at random positions, ids `{id_prefix}-{i}`.
    pub fn new(id_prefix: &str, config: BotConfig, mut rng: R) -> Self {
        let b = config.bounds;
        let bots = (0..config.count)
            .map(|i| Bot {
                id: ParticipantId::from_string(format!("{}-{}", id_prefix, i)),
                position: Vector2::new(
                    rng.gen_range(b.min_lng..=b.max_lng),
                    rng.gen_range(b.min_lat..=b.max_lat),
                ),
                heading: rng.gen_range(0.0..TAU),
                speed: rng.gen_range(config.min_speed_deg..=config.max_speed_deg),
            })
            .collect();

        let timer = PeriodicTimer::new(config.tick_interval);
        Self {
            config,
            bots,
            rng,
            timer,
        }
    }

    pub fn bots(&self) -> &[Bot] {
        &self.bots
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.bots.iter().map(|b| b.id.clone()).collect()
    }

    pub fn is_bot(&self, id: &ParticipantId) -> bool {
        self.bots.iter().any(|b| &b.id == id)
    }

    pub fn start(&mut self, now: Duration) -> bool {
        self.timer.start(now)
    }

    pub fn stop(&mut self) {
        self.timer.stop();
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn poll(&mut self, now: Duration) -> bool {
        self.timer.poll(now)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timer.next_due()
    }

    /// Advances every bot by one tick.
    pub fn step(&mut self) {
        for bot in &mut self.bots {
            step_bot(bot, &self.config, &mut self.rng);
        }
    }

    /// Current positions as updates stamped with `timestamp`.
    pub fn updates(&self, timestamp: u64) -> Vec<PositionUpdate> {
        self.bots
            .iter()
            .map(|bot| PositionUpdate::new(bot.id.clone(), bot.location(), timestamp))
            .collect()
    }

    /// Moves every bot once and returns the resulting updates.
    pub fn tick(&mut self, timestamp: u64) -> Vec<PositionUpdate> {
        self.step();
        self.updates(timestamp)
    }

    /// Stops the timer, forgets every bot and returns the task that deletes
    /// their `locations` and `users` rows.
    ///
    /// Rows left behind by a failed cleanup age out of bootstrap after the
    /// idle window.
    pub fn cleanup_task<S>(&mut self, store: Arc<S>) -> impl Future<Output = Result<usize, SyncError>> + Send + 'static
    where
        S: DurableStore + ?Sized,
        R: 'static,
    {
        self.timer.stop();
        let ids: Vec<Value> = self
            .bots
            .drain(..)
            .map(|b| Value::from(b.id.as_str()))
            .collect();

        async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let count = ids.len();
            let locations = store
                .delete(LOCATIONS_TABLE, &Filter::any_of(LOCATIONS_KEY, ids.clone()))
                .await?;
            let users = store
                .delete(USERS_TABLE, &Filter::any_of(USERS_KEY, ids))
                .await?;

            info!(bots = count, locations, users, "Bots cleaned up");
            Ok(count)
        }
    }
}

/// One movement step: jitter, advance, reflect at the edges, clamp.
fn step_bot<R: Rng>(bot: &mut Bot, config: &BotConfig, rng: &mut R) {
    if rng.gen_bool(config.turn_probability.clamp(0.0, 1.0)) {
        let max_turn = config.max_turn_rad.abs();
        bot.heading += rng.gen_range(-max_turn..=max_turn);
    }

    let direction = Vector2::new(bot.heading.cos(), bot.heading.sin());
    let mut next = bot.position + direction * bot.speed;
    let b = &config.bounds;

    if next.y < b.min_lat || next.y > b.max_lat {
        bot.heading = -bot.heading;
    }
    if next.x < b.min_lng || next.x > b.max_lng {
        bot.heading = PI - bot.heading;
    }

    next.x = next.x.clamp(b.min_lng, b.max_lng);
    next.y = next.y.clamp(b.min_lat, b.max_lat);
    bot.position = next;
    bot.heading = bot.heading.rem_euclid(TAU);

    debug!(id = %bot.id, lat = next.y, lng = next.x, "Bot moved");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{to_record, IdentityRecord, LocationRecord};
    use crate::sled_store::SledStore;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::f64::consts::FRAC_PI_2;

    fn straight_line_config(count: usize) -> BotConfig {
        BotConfig {
            count,
            turn_probability: 0.0,
            ..BotConfig::default()
        }
    }

    #[test]
    fn test_same_seed_same_trajectory() {
        let mut a = BotDriver::new("bot", BotConfig::default(), StdRng::seed_from_u64(7));
        let mut b = BotDriver::new("bot", BotConfig::default(), StdRng::seed_from_u64(7));

        for t in 0..50 {
            assert_eq!(a.tick(t), b.tick(t));
        }
        assert_eq!(a.bots(), b.bots());
    }

    #[test]
    fn test_bots_stay_in_bounds() {
        let config = BotConfig {
            count: 10,
            min_speed_deg: 0.001,
            max_speed_deg: 0.003,
            turn_probability: 0.5,
            ..BotConfig::default()
        };
        let bounds = config.bounds;
        let mut driver = BotDriver::new("bot", config, StdRng::seed_from_u64(99));

        for _ in 0..1_000 {
            driver.step();
            for bot in driver.bots() {
                assert!(bounds.contains(&bot.location()), "{:?} escaped", bot.location());
            }
        }
    }

    #[test]
    fn test_latitude_edge_negates_heading() {
        let config = straight_line_config(1);
        let bounds = config.bounds;
        let mut driver = BotDriver::new("bot", config, StdRng::seed_from_u64(1));
        {
            let bot = &mut driver.bots[0];
            bot.position = Vector2::new(bounds.center().lng, bounds.max_lat - 0.0001);
            bot.heading = FRAC_PI_2;
            bot.speed = 0.001;
        }

        driver.step();

        let bot = &driver.bots()[0];
        assert_relative_eq!(bot.position.y, bounds.max_lat);
        assert_relative_eq!(bot.heading, 3.0 * FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_longitude_edge_reflects_heading() {
        let config = straight_line_config(1);
        let bounds = config.bounds;
        let mut driver = BotDriver::new("bot", config, StdRng::seed_from_u64(1));
        {
            let bot = &mut driver.bots[0];
            bot.position = Vector2::new(bounds.max_lng - 0.0001, bounds.center().lat);
            bot.heading = 0.0;
            bot.speed = 0.001;
        }

        driver.step();

        let bot = &driver.bots()[0];
        assert_relative_eq!(bot.position.x, bounds.max_lng);
        assert_relative_eq!(bot.heading, PI, epsilon = 1e-12);
    }

    #[test]
    fn test_updates_carry_bot_ids() {
        let driver = BotDriver::new("host-bot", straight_line_config(3), StdRng::seed_from_u64(3));
        let updates = driver.updates(123);

        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2].participant_id.as_str(), "host-bot-2");
        assert!(updates.iter().all(|u| u.timestamp == 123 && u.online));
        assert!(driver.is_bot(&ParticipantId::from("host-bot-0")));
    }

    #[test]
    fn test_timer_lifecycle() {
        let mut driver = BotDriver::new("bot", BotConfig::default(), StdRng::seed_from_u64(3));
        assert!(driver.start(Duration::ZERO));
        assert!(!driver.start(Duration::from_secs(1)));
        assert!(driver.poll(Duration::from_secs(2)));

        driver.stop();
        assert!(!driver.is_running());
        assert!(!driver.poll(Duration::from_secs(100)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_every_bot_row() {
        let store = Arc::new(SledStore::open_temp().unwrap());
        let mut driver = BotDriver::new("bot", straight_line_config(3), StdRng::seed_from_u64(5));
        driver.start(Duration::ZERO);

        for update in driver.updates(10) {
            let row = to_record(&LocationRecord::from_update(&update)).unwrap();
            store.upsert(LOCATIONS_TABLE, row, LOCATIONS_KEY).await.unwrap();
            let identity = to_record(&IdentityRecord::new(update.participant_id.clone(), 10)).unwrap();
            store.upsert(USERS_TABLE, identity, USERS_KEY).await.unwrap();
        }
        // A real participant that must survive
        let human = PositionUpdate::new(ParticipantId::from("human"), GeoPoint::new(1.0, 1.0).unwrap(), 10);
        let row = to_record(&LocationRecord::from_update(&human)).unwrap();
        store.upsert(LOCATIONS_TABLE, row, LOCATIONS_KEY).await.unwrap();

        let removed = driver.cleanup_task(store.clone()).await.unwrap();

        assert_eq!(removed, 3);
        assert!(driver.bots().is_empty());
        assert!(!driver.is_running());
        let locations = store.select(LOCATIONS_TABLE, &Filter::All).await.unwrap();
        assert_eq!(locations.len(), 1);
        assert!(store.select(USERS_TABLE, &Filter::All).await.unwrap().is_empty());
    }
}
