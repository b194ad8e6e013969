//! Durable key-value store abstraction.
//!
//! The sync engine only needs three operations against its backing store:
//! keyed upsert, filtered select and filtered delete. Records are flat JSON
//! objects so any row-oriented backend can implement the trait.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use crate::error::EnvError;

/// A single row: column name -> JSON value.
pub type Record = Map<String, Value>;

/// Abstraction for the durable store late joiners bootstrap from.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Inserts `record` into `table`, replacing any row whose `conflict_key`
    /// column holds the same value.
    async fn upsert(&self, table: &str, record: Record, conflict_key: &str) -> Result<(), EnvError>;

    /// Returns every row of `table` matching `filter`.
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, EnvError>;

    /// Deletes every row of `table` matching `filter`, returning how many were removed.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, EnvError>;
}

/// Row predicate understood by every `DurableStore` implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row
    All,

    /// `column == value`
    Eq(String, Value),

    /// `column != value` (rows missing the column match)
    Ne(String, Value),

    /// `column >= value`
    Gte(String, Value),

    /// `column` equals one of the values
    In(String, Vec<Value>),

    /// All sub-filters match
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(column.into(), value.into())
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(column.into(), value.into())
    }

    pub fn any_of(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In(column.into(), values)
    }

    /// Evaluates the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, value) => record
                .get(column)
                .map(|v| compare(v, value) == Some(Ordering::Equal))
                .unwrap_or(false),
            Filter::Ne(column, value) => record
                .get(column)
                .map(|v| compare(v, value) != Some(Ordering::Equal))
                .unwrap_or(true),
            Filter::Gte(column, value) => record
                .get(column)
                .and_then(|v| compare(v, value))
                .map(|ord| ord != Ordering::Less)
                .unwrap_or(false),
            Filter::In(column, values) => record
                .get(column)
                .map(|v| values.iter().any(|candidate| compare(v, candidate) == Some(Ordering::Equal)))
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
        }
    }
}

/// Orders two JSON values of the same kind. Numbers compare numerically,
/// strings lexically; mismatched kinds are only ever "equal" if identical.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_eq_and_ne() {
        let r = row(json!({"user_id": "abc", "lat": 1.0}));

        assert!(Filter::eq("user_id", "abc").matches(&r));
        assert!(!Filter::eq("user_id", "xyz").matches(&r));
        assert!(Filter::ne("user_id", "xyz").matches(&r));
        assert!(Filter::ne("missing", "x").matches(&r));
    }

    #[test]
    fn test_filter_gte_numeric() {
        let r = row(json!({"updated_at": 1_000u64}));

        assert!(Filter::gte("updated_at", 1_000u64).matches(&r));
        assert!(Filter::gte("updated_at", 999.5).matches(&r));
        assert!(!Filter::gte("updated_at", 1_001u64).matches(&r));
        assert!(!Filter::gte("missing", 0).matches(&r));
    }

    #[test]
    fn test_filter_and_in() {
        let r = row(json!({"id": "bot-1", "color_hash": "#ffffff"}));

        let f = Filter::And(vec![
            Filter::any_of("id", vec![json!("bot-0"), json!("bot-1")]),
            Filter::All,
        ]);
        assert!(f.matches(&r));

        let g = Filter::And(vec![f, Filter::eq("color_hash", "#000000")]);
        assert!(!g.matches(&r));
    }
}
