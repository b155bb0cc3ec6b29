// In-memory RemoteStore
// Backs the test-suite and the `demo` command. Supports injected failures and
// cooperative yielding between operations so concurrent callers interleave.

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{
    matches_all, resolve_joins, ChangeEvent, ChangeFeed, ChangeKind, EventFilter, Filter, Query,
    RemoteStore, Row, StoreOp, Subscription, SubscriptionId, Table,
};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    feed: ChangeFeed,
    faults: Mutex<Vec<(Table, StoreOp)>>,
    interleave: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield to the scheduler before every operation, so two tasks racing
    /// through multi-step writes actually interleave.
    pub fn interleaved() -> Self {
        let store = Self::default();
        store.interleave.store(true, Ordering::Relaxed);
        store
    }

    /// Makes the next `op` against `table` fail with `StoreError::Injected`.
    pub fn fail_next(&self, table: Table, op: StoreOp) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((table, op));
        }
    }

    /// Snapshot of a table in insertion order.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.tables
            .lock()
            .map(|t| t.get(&table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    fn lock_tables(&self) -> Result<MutexGuard<'_, HashMap<Table, Vec<Row>>>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    async fn enter(&self, table: Table, op: StoreOp) -> Result<(), StoreError> {
        if self.interleave.load(Ordering::Relaxed) {
            tokio::task::yield_now().await;
        }
        let injected = match self.faults.lock() {
            Ok(mut faults) => match faults.iter().position(|f| *f == (table, op)) {
                Some(index) => {
                    faults.remove(index);
                    true
                }
                None => false,
            },
            Err(_) => false,
        };
        if injected {
            debug!("Injected {:?} failure on {}", op, table);
            return Err(StoreError::Injected { table, op });
        }
        Ok(())
    }

    fn check_unique(table: Table, existing: &[Row], candidate: &Row) -> Result<(), StoreError> {
        let id = candidate.get("id");
        for other in existing {
            if other.get("id") == id {
                return Err(StoreError::Conflict { table, key: table.describe_key(candidate, &["id"]) });
            }
            for key in table.unique_keys() {
                if key.iter().all(|c| other.get(*c) == candidate.get(*c)) {
                    return Err(StoreError::Conflict { table, key: table.describe_key(candidate, key) });
                }
            }
        }
        Ok(())
    }

    fn publish_all(&self, table: Table, kind: ChangeKind, rows: &[Row]) {
        for row in rows {
            self.feed.publish(&ChangeEvent { table, kind, row: row.clone() });
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.enter(query.table, StoreOp::Query).await?;
        let snapshot = self.lock_tables()?.get(&query.table).cloned().unwrap_or_default();
        let mut rows = query.apply_local(snapshot);
        resolve_joins(self, &mut rows, &query.joins).await?;
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        let mut rows = self.insert_many(table, vec![row]).await?;
        rows.pop().ok_or(StoreError::NotFound { table })
    }

    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        self.enter(table, StoreOp::Insert).await?;
        let prepared: Vec<Row> = rows.into_iter().map(|r| table.prepare_insert(r)).collect();
        {
            let mut tables = self.lock_tables()?;
            let existing = tables.entry(table).or_default();
            let mut staged = existing.clone();
            for row in &prepared {
                Self::check_unique(table, &staged, row)?;
                staged.push(row.clone());
            }
            *existing = staged;
        }
        self.publish_all(table, ChangeKind::Insert, &prepared);
        Ok(prepared)
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<Vec<Row>, StoreError> {
        self.enter(table, StoreOp::Update).await?;
        let mut updated = Vec::new();
        {
            let mut tables = self.lock_tables()?;
            for row in tables.entry(table).or_default().iter_mut() {
                if matches_all(filters, row) {
                    table.apply_patch(row, &patch);
                    updated.push(row.clone());
                }
            }
        }
        self.publish_all(table, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn upsert(&self, table: Table, row: Row, conflict: &[&str]) -> Result<Row, StoreError> {
        self.enter(table, StoreOp::Upsert).await?;
        let (written, kind) = {
            let mut tables = self.lock_tables()?;
            let rows = tables.entry(table).or_default();
            let position = rows.iter().position(|existing| {
                conflict
                    .iter()
                    .all(|c| existing.get(*c).unwrap_or(&Value::Null) == row.get(*c).unwrap_or(&Value::Null))
            });
            match position {
                Some(index) => {
                    table.apply_patch(&mut rows[index], &row);
                    (rows[index].clone(), ChangeKind::Update)
                }
                None => {
                    let prepared = table.prepare_insert(row);
                    Self::check_unique(table, rows, &prepared)?;
                    rows.push(prepared.clone());
                    (prepared, ChangeKind::Insert)
                }
            }
        };
        self.publish_all(table, kind, std::slice::from_ref(&written));
        Ok(written)
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<usize, StoreError> {
        self.enter(table, StoreOp::Delete).await?;
        let removed: Vec<Row> = {
            let mut tables = self.lock_tables()?;
            let rows = tables.entry(table).or_default();
            let (gone, kept): (Vec<Row>, Vec<Row>) = rows.drain(..).partition(|r| matches_all(filters, r));
            *rows = kept;
            gone
        };
        self.publish_all(table, ChangeKind::Delete, &removed);
        Ok(removed.len())
    }

    fn subscribe(&self, table: Table, events: EventFilter, row_filter: Option<Filter>) -> Subscription {
        self.feed.subscribe(table, events, row_filter)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.feed.unsubscribe(id);
    }
}
