//! Storage capability used by the runtime. A `Store` hands out transactions; everything the
//! pipeline reads or writes goes through the `StoreTx` it was given.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreOptions};

use crate::config::TableSpec;
use crate::error::AppError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A row keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

impl Condition {
    pub fn eq(column: &str, value: Value) -> Self {
        Condition::Eq(column.to_string(), value)
    }

    pub fn is_in(column: &str, values: Vec<Value>) -> Self {
        Condition::In(column.to_string(), values)
    }

    pub fn is_null(column: &str) -> Self {
        Condition::IsNull(column.to_string())
    }

    /// In-process evaluation, used by the memory store and by tests.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq(col, v) => row.get(col).map(|x| values_equal(x, v)).unwrap_or(false),
            Condition::In(col, vs) => row
                .get(col)
                .map(|x| vs.iter().any(|v| values_equal(x, v)))
                .unwrap_or(false),
            Condition::IsNull(col) => row.get(col).map(Value::is_null).unwrap_or(true),
        }
    }
}

/// Conjunctive filter plus paging. Results are ordered by primary key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    pub conditions: Vec<Condition>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Selection {
    pub fn filter(conditions: Vec<Condition>) -> Self {
        Selection {
            conditions,
            limit: None,
            offset: None,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, AppError>;
}

/// One open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Insert and return the stored row. A duplicate primary key is `AppError::Conflict`.
    async fn insert(&mut self, table: &TableSpec, row: Row) -> Result<Row, AppError>;

    /// Apply `changes` to every matching row; returns the updated rows.
    async fn update(&mut self, table: &TableSpec, conditions: &[Condition], changes: Row) -> Result<Vec<Row>, AppError>;

    /// Delete every matching row; returns the deleted rows.
    async fn delete(&mut self, table: &TableSpec, conditions: &[Condition]) -> Result<Vec<Row>, AppError>;

    async fn select(&mut self, table: &TableSpec, selection: &Selection) -> Result<Vec<Row>, AppError>;

    /// A conflict detected here is `AppError::SerializationConflict`.
    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}

/// Loose JSON equality: numbers compare by value, so 1 and 1.0 match.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Total order over key values: nulls first, then booleans, numbers, strings.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Stable string form of a key value, for grouping rows in hash maps.
pub fn key_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn conditions_match_loosely() {
        let r = row(json!({ "id": 3, "name": "x", "gone": null }));
        assert!(Condition::eq("id", json!(3.0)).matches(&r));
        assert!(Condition::is_in("name", vec![json!("y"), json!("x")]).matches(&r));
        assert!(!Condition::is_in("name", vec![]).matches(&r));
        assert!(Condition::is_null("gone").matches(&r));
        assert!(Condition::is_null("missing").matches(&r));
        assert!(!Condition::eq("missing", json!(1)).matches(&r));
    }

    #[test]
    fn key_order_and_grouping() {
        assert_eq!(compare_values(&json!(9), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(key_string(&json!(7)), "7");
        assert_eq!(key_string(&json!("7")), "7");
    }
}
