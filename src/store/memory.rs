//! In-memory store with optimistic concurrency. Each transaction works on copies of the
//! tables it touches and records their versions; commit fails with a serialization
//! conflict if any of those tables changed underneath it.

use super::{compare_values, values_equal, Condition, Row, Selection, Store, StoreTx};
use crate::config::TableSpec;
use crate::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default)]
struct MemoryTable {
    version: u64,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    injected_conflicts: u32,
    commits: u64,
    rollbacks: u64,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryState>>,
}

fn lock(shared: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>, AppError> {
    shared
        .lock()
        .map_err(|_| AppError::Store("memory store lock poisoned".into()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` commits fail with a serialization conflict.
    pub fn fail_next_commits(&self, n: u32) {
        if let Ok(mut state) = self.shared.lock() {
            state.injected_conflicts += n;
        }
    }

    /// Committed rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.shared
            .lock()
            .map(|s| s.tables.get(table).map(|t| t.rows.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn commit_count(&self) -> u64 {
        self.shared.lock().map(|s| s.commits).unwrap_or(0)
    }

    pub fn rollback_count(&self) -> u64 {
        self.shared.lock().map(|s| s.rollbacks).unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, AppError> {
        Ok(Box::new(MemoryTx {
            shared: Arc::clone(&self.shared),
            seen: HashMap::new(),
            working: HashMap::new(),
            dirty: HashSet::new(),
        }))
    }
}

struct MemoryTx {
    shared: Arc<Mutex<MemoryState>>,
    /// Version of each table when this transaction first touched it.
    seen: HashMap<String, u64>,
    working: HashMap<String, MemoryTable>,
    dirty: HashSet<String>,
}

impl MemoryTx {
    fn table(&mut self, name: &str) -> Result<&mut MemoryTable, AppError> {
        match self.working.entry(name.to_string()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let snapshot = lock(&self.shared)?.tables.get(name).cloned().unwrap_or_default();
                self.seen.insert(name.to_string(), snapshot.version);
                Ok(e.insert(snapshot))
            }
        }
    }
}

fn same_key(spec: &TableSpec, a: &Row, b: &Row) -> bool {
    spec.primary_key.iter().all(|c| match (a.get(c), b.get(c)) {
        (Some(x), Some(y)) => values_equal(x, y),
        _ => false,
    })
}

fn check_columns(spec: &TableSpec, row: &Row) -> Result<(), AppError> {
    match row.keys().find(|k| spec.column(k).is_none()) {
        Some(k) => Err(AppError::Store(format!("{}: unknown column '{}'", spec.name, k))),
        None => Ok(()),
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert(&mut self, spec: &TableSpec, mut row: Row) -> Result<Row, AppError> {
        check_columns(spec, &row)?;
        let table = self.table(&spec.name)?;

        // Integer keys left empty get the next value, like a serial column.
        if let [pk] = spec.primary_key.as_slice() {
            let integral = spec.column(pk).map(|c| c.ty.is_integral()).unwrap_or(false);
            let missing = row.get(pk).map(Value::is_null).unwrap_or(true);
            if integral && missing {
                let next = table
                    .rows
                    .iter()
                    .filter_map(|r| r.get(pk).and_then(Value::as_i64))
                    .max()
                    .unwrap_or(0)
                    + 1;
                row.insert(pk.clone(), Value::from(next));
            }
        }

        let stored: Row = spec
            .columns
            .iter()
            .map(|c| (c.name.clone(), row.remove(&c.name).unwrap_or(Value::Null)))
            .collect();
        if table.rows.iter().any(|r| same_key(spec, r, &stored)) {
            return Err(AppError::Conflict(format!("duplicate key in {}", spec.name)));
        }
        table.rows.push(stored.clone());
        self.dirty.insert(spec.name.clone());
        tracing::debug!(table = %spec.name, "memory insert");
        Ok(stored)
    }

    async fn update(&mut self, spec: &TableSpec, conditions: &[Condition], changes: Row) -> Result<Vec<Row>, AppError> {
        check_columns(spec, &changes)?;
        let table = self.table(&spec.name)?;
        let mut updated = Vec::new();
        for r in table.rows.iter_mut().filter(|r| conditions.iter().all(|c| c.matches(r))) {
            for (k, v) in &changes {
                r.insert(k.clone(), v.clone());
            }
            updated.push(r.clone());
        }
        if !updated.is_empty() {
            self.dirty.insert(spec.name.clone());
        }
        tracing::debug!(table = %spec.name, rows = updated.len(), "memory update");
        Ok(updated)
    }

    async fn delete(&mut self, spec: &TableSpec, conditions: &[Condition]) -> Result<Vec<Row>, AppError> {
        let table = self.table(&spec.name)?;
        let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut table.rows)
            .into_iter()
            .partition(|r| conditions.iter().all(|c| c.matches(r)));
        table.rows = kept;
        if !removed.is_empty() {
            self.dirty.insert(spec.name.clone());
        }
        tracing::debug!(table = %spec.name, rows = removed.len(), "memory delete");
        Ok(removed)
    }

    async fn select(&mut self, spec: &TableSpec, selection: &Selection) -> Result<Vec<Row>, AppError> {
        let table = self.table(&spec.name)?;
        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|r| selection.conditions.iter().all(|c| c.matches(r)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            spec.primary_key
                .iter()
                .map(|c| compare_values(a.get(c).unwrap_or(&Value::Null), b.get(c).unwrap_or(&Value::Null)))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let offset = selection.offset.unwrap_or(0) as usize;
        let limit = selection.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryTx {
            shared,
            seen,
            mut working,
            dirty,
        } = *self;
        let mut state = lock(&shared)?;
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            state.rollbacks += 1;
            return Err(AppError::serialization_conflict());
        }
        let stale = seen
            .iter()
            .any(|(name, v)| state.tables.get(name).map(|t| t.version).unwrap_or(0) != *v);
        if stale {
            state.rollbacks += 1;
            return Err(AppError::serialization_conflict());
        }
        for name in dirty {
            if let Some(mut table) = working.remove(&name) {
                table.version += 1;
                state.tables.insert(name, table);
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        lock(&self.shared)?.rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnSpec, FieldType};
    use serde_json::json;

    fn spec() -> TableSpec {
        TableSpec {
            name: "items".into(),
            primary_key: vec!["id".into()],
            columns: vec![
                ColumnSpec { name: "id".into(), ty: FieldType::Integer, array: false },
                ColumnSpec { name: "name".into(), ty: FieldType::String, array: false },
            ],
        }
    }

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn integer_keys_are_assigned_and_duplicates_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert(&spec(), row(json!({ "name": "a" }))).await.unwrap();
        let b = tx.insert(&spec(), row(json!({ "name": "b" }))).await.unwrap();
        assert_eq!(a["id"], json!(1));
        assert_eq!(b["id"], json!(2));
        let dup = tx.insert(&spec(), row(json!({ "id": 2, "name": "c" }))).await;
        assert!(matches!(dup, Err(AppError::Conflict(_))));
        tx.commit().await.unwrap();
        assert_eq!(store.rows("items").len(), 2);
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&spec(), row(json!({ "name": "a" }))).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.rows("items").is_empty());
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_conflict_at_commit() {
        let store = MemoryStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.select(&spec(), &Selection::default()).await.unwrap();
        second.insert(&spec(), row(json!({ "name": "b" }))).await.unwrap();
        first.insert(&spec(), row(json!({ "name": "a" }))).await.unwrap();
        second.commit().await.unwrap();
        let err = first.commit().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn injected_conflicts_fail_commits_in_turn() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let tx = store.begin().await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_retryable());
        let tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn select_orders_by_key_and_pages() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for id in [10, 9, 11] {
            tx.insert(&spec(), row(json!({ "id": id, "name": "x" }))).await.unwrap();
        }
        let page = tx
            .select(&spec(), &Selection { conditions: vec![], limit: Some(2), offset: Some(1) })
            .await
            .unwrap();
        let ids: Vec<i64> = page.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![10, 11]);

        let updated = tx
            .update(&spec(), &[Condition::eq("id", json!(9))], row(json!({ "name": "nine" })))
            .await
            .unwrap();
        assert_eq!(updated[0]["name"], json!("nine"));
        let removed = tx.delete(&spec(), &[Condition::is_in("id", vec![json!(9), json!(10)])]).await.unwrap();
        assert_eq!(removed.len(), 2);
    }
}
