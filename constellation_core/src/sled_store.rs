//! Sled-backed `DurableStore`.
//!
//! One sled tree per table. Rows are stored as JSON under the value of
//! their conflict column, which makes upsert a plain `insert`.

use async_trait::async_trait;
use constellation_env::{DurableStore, EnvError, Filter, Record};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

/// Embedded persistent store for positions and identities.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Opens (or creates) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EnvError> {
        let db = sled::open(path)
            .map_err(|e| EnvError::storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Opens a throwaway store that is deleted on drop.
    pub fn open_temp() -> Result<Self, EnvError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EnvError::storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    fn tree(&self, table: &str) -> Result<sled::Tree, EnvError> {
        self.db
            .open_tree(table)
            .map_err(|e| EnvError::storage(format!("Failed to open table {}: {}", table, e)))
    }

    fn flush(&self) -> Result<(), EnvError> {
        self.db
            .flush()
            .map_err(|e| EnvError::storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// Key bytes for a conflict column value.
fn key_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

/// Decodes a stored row. Undecodable rows are logged and treated as absent
/// so one bad value cannot hide the rest of the table.
fn decode(table: &str, key: &[u8], bytes: &[u8]) -> Option<Record> {
    match serde_json::from_slice(bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(
                table,
                key = %String::from_utf8_lossy(key),
                error = %e,
                "Skipping undecodable row"
            );
            None
        }
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn upsert(&self, table: &str, record: Record, conflict_key: &str) -> Result<(), EnvError> {
        let key = record
            .get(conflict_key)
            .map(key_bytes)
            .ok_or_else(|| EnvError::storage(format!("{} row is missing {}", table, conflict_key)))?;
        let value = serde_json::to_vec(&record)?;

        self.tree(table)?
            .insert(key, value)
            .map_err(|e| EnvError::storage(format!("Insert failed: {}", e)))?;
        self.flush()
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, EnvError> {
        let mut rows = Vec::new();
        for result in self.tree(table)?.iter() {
            let (key, value) = result
                .map_err(|e| EnvError::storage(format!("Iteration failed: {}", e)))?;
            match decode(table, &key, &value) {
                Some(record) if filter.matches(&record) => rows.push(record),
                _ => {}
            }
        }
        Ok(rows)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, EnvError> {
        let tree = self.tree(table)?;
        let mut doomed = Vec::new();
        for result in tree.iter() {
            let (key, value) = result
                .map_err(|e| EnvError::storage(format!("Iteration failed: {}", e)))?;
            if decode(table, &key, &value).is_some_and(|record| filter.matches(&record)) {
                doomed.push(key);
            }
        }

        for key in &doomed {
            tree.remove(key)
                .map_err(|e| EnvError::storage(format!("Remove failed: {}", e)))?;
        }
        if !doomed.is_empty() {
            self.flush()?;
        }
        Ok(doomed.len())
    }
}
