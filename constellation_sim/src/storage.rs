//! In-memory durable store with injectable read/write failures.

use async_trait::async_trait;
use constellation_env::{DurableStore, EnvError, Filter, Record};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct StoreState {
    /// table -> conflict key -> row
    tables: BTreeMap<String, BTreeMap<String, Record>>,
    read_failure_rate: f64,
    write_failure_rate: f64,
    rng: ChaCha8Rng,
}

impl StoreState {
    fn fails(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen_bool(rate)
    }
}

/// Shared table store. Clones see the same rows.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                tables: BTreeMap::new(),
                read_failure_rate: 0.0,
                write_failure_rate: 0.0,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_read_failure_rate(&self, rate: f64) {
        self.lock().read_failure_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_write_failure_rate(&self, rate: f64) {
        self.lock().write_failure_rate = rate.clamp(0.0, 1.0);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Row whose conflict key equals `key`, if any.
    pub fn get(&self, table: &str, key: &str) -> Option<Record> {
        self.lock().tables.get(table).and_then(|rows| rows.get(key).cloned())
    }
}

fn key_of(record: &Record, conflict_key: &str) -> Result<String, EnvError> {
    match record.get(conflict_key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(EnvError::storage(format!("record has no '{}' column", conflict_key))),
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert(&self, table: &str, record: Record, conflict_key: &str) -> Result<(), EnvError> {
        let key = key_of(&record, conflict_key)?;
        let mut state = self.lock();
        let rate = state.write_failure_rate;
        if state.fails(rate) {
            return Err(EnvError::storage(format!("write to {} failed", table)));
        }
        state.tables.entry(table.to_string()).or_default().insert(key, record);
        Ok(())
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, EnvError> {
        let mut state = self.lock();
        let rate = state.read_failure_rate;
        if state.fails(rate) {
            return Err(EnvError::storage(format!("read from {} failed", table)));
        }
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, EnvError> {
        let mut state = self.lock();
        let rate = state.write_failure_rate;
        if state.fails(rate) {
            return Err(EnvError::storage(format!("delete from {} failed", table)));
        }
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, r| !filter.matches(r));
        Ok(before - rows.len())
    }
}
