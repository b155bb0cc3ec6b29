// src/store/sqlite.rs
//! SQLite-backed `RemoteStore`.
//!
//! Every table holds JSON documents keyed by id; filtering and ordering go
//! through `json_extract`. Change events are delivered to subscribers of this
//! process only.

use async_trait::async_trait;
use log::{debug, info};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{
    resolve_joins, ChangeEvent, ChangeFeed, ChangeKind, EventFilter, Filter, FilterOp, Order, Query,
    RemoteStore, Row, Subscription, SubscriptionId, Table,
};
use crate::error::StoreError;

/// SQLite document store
pub struct SqliteStore {
    /// Connection, serialised behind a mutex
    conn: Mutex<Connection>,

    feed: ChangeFeed,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened SQLite store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feed: ChangeFeed::new(),
        })
    }

    /// Create the document tables
    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        for table in Table::ALL {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id TEXT PRIMARY KEY,
                        body TEXT NOT NULL
                    )",
                    table.as_str()
                ),
                [],
            )?;
        }

        for table in Table::ALL {
            for (n, key) in table.unique_keys().iter().enumerate() {
                let columns = key
                    .iter()
                    .map(|c| format!("json_extract(body, '$.{}')", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                conn.execute(
                    &format!(
                        "CREATE UNIQUE INDEX IF NOT EXISTS {}_unique_{} ON {} ({})",
                        table.as_str(),
                        n,
                        table.as_str(),
                        columns
                    ),
                    [],
                )?;
            }
        }

        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    fn publish_all(&self, table: Table, kind: ChangeKind, rows: &[Row]) {
        for row in rows {
            self.feed.publish(&ChangeEvent { table, kind, row: row.clone() });
        }
    }

    fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let (where_sql, mut values) = where_clause(&query.filters)?;
        let order_sql = order_clause(&query.order)?;
        let table = query.table.as_str();

        let mut sql = match &query.distinct_on {
            Some(column) => {
                let partition = column_expr(column)?;
                let window_order = if order_sql.is_empty() { "ORDER BY id".to_string() } else { order_sql.clone() };
                format!(
                    "SELECT body FROM (
                        SELECT body, ROW_NUMBER() OVER (PARTITION BY {} {}) AS rn FROM {} {}
                     ) WHERE rn = 1 {}",
                    partition, window_order, table, where_sql, order_sql
                )
            }
            None => format!("SELECT body FROM {} {} {}", table, where_sql, order_sql),
        };
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies.iter().map(|b| parse_body(b)).collect()
    }

    fn matching(tx: &Transaction<'_>, table: Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError> {
        let (where_sql, values) = where_clause(filters)?;
        let mut stmt = tx.prepare(&format!("SELECT body FROM {} {}", table.as_str(), where_sql))?;
        let bodies = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies.iter().map(|b| parse_body(b)).collect()
    }

    fn write_new(tx: &Transaction<'_>, table: Table, row: &Row) -> Result<(), StoreError> {
        let id = row_id(row);
        let body = serde_json::to_string(row)?;
        tx.execute(&format!("INSERT INTO {} (id, body) VALUES (?1, ?2)", table.as_str()), params![id, body])
            .map_err(|e| map_constraint(e, table, row))?;
        Ok(())
    }

    fn write_existing(tx: &Transaction<'_>, table: Table, row: &Row) -> Result<(), StoreError> {
        let body = serde_json::to_string(row)?;
        tx.execute(&format!("UPDATE {} SET body = ?1 WHERE id = ?2", table.as_str()), params![body, row_id(row)])
            .map_err(|e| map_constraint(e, table, row))?;
        Ok(())
    }
}

fn row_id(row: &Row) -> String {
    row.get("id").and_then(Value::as_str).unwrap_or_default().to_string()
}

fn parse_body(body: &str) -> Result<Row, StoreError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::Unavailable(format!("stored document is not an object: {}", other))),
    }
}

fn map_constraint(err: rusqlite::Error, table: Table, row: &Row) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, message) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict {
                table,
                key: table.describe_key(row, violated_key(table, message.as_deref())),
            }
        }
        _ => StoreError::Sqlite(err),
    }
}

const PRIMARY_KEY: &[&str] = &["id"];

/// Columns of the unique index named in a constraint message such as
/// `UNIQUE constraint failed: index 'message_status_unique_0'`; the primary
/// key otherwise.
fn violated_key(table: Table, message: Option<&str>) -> &'static [&'static str] {
    let message = message.unwrap_or_default();
    table
        .unique_keys()
        .iter()
        .enumerate()
        .find(|(n, _)| message.contains(&format!("'{}_unique_{}'", table.as_str(), n)))
        .map(|(_, key)| *key)
        .unwrap_or(PRIMARY_KEY)
}

/// Column names are spliced into SQL, so only plain identifiers are accepted.
fn column_expr(column: &str) -> Result<String, StoreError> {
    let valid = !column.is_empty() && column.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::Unavailable(format!("invalid column name '{}'", column)));
    }
    Ok(format!("json_extract(body, '$.{}')", column))
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn where_clause(filters: &[Filter]) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    for filter in filters {
        let expr = column_expr(&filter.column)?;
        match filter.op {
            FilterOp::Eq => {
                clauses.push(format!("{} = ?", expr));
                values.push(sql_value(&filter.value));
            }
            FilterOp::Neq => {
                clauses.push(format!("{} <> ?", expr));
                values.push(sql_value(&filter.value));
            }
            FilterOp::IsNull => clauses.push(format!("{} IS NULL", expr)),
            FilterOp::NotNull => clauses.push(format!("{} IS NOT NULL", expr)),
            FilterOp::In => {
                let items: &[Value] = match &filter.value {
                    Value::Array(items) => items.as_slice(),
                    _ => &[],
                };
                if items.is_empty() {
                    clauses.push("0".to_string());
                } else {
                    let marks = vec!["?"; items.len()].join(", ");
                    clauses.push(format!("{} IN ({})", expr, marks));
                    values.extend(items.iter().map(sql_value));
                }
            }
        }
    }
    let sql = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
    Ok((sql, values))
}

fn order_clause(order: &[Order]) -> Result<String, StoreError> {
    if order.is_empty() {
        return Ok(String::new());
    }
    let parts = order
        .iter()
        .map(|o| Ok(format!("{} {}", column_expr(&o.column)?, if o.ascending { "ASC" } else { "DESC" })))
        .collect::<Result<Vec<_>, StoreError>>()?;
    Ok(format!("ORDER BY {}", parts.join(", ")))
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut rows = self.select(query)?;
        resolve_joins(self, &mut rows, &query.joins).await?;
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        let mut rows = self.insert_many(table, vec![row]).await?;
        rows.pop().ok_or(StoreError::NotFound { table })
    }

    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        let prepared: Vec<Row> = rows.into_iter().map(|r| table.prepare_insert(r)).collect();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for row in &prepared {
                Self::write_new(&tx, table, row)?;
            }
            tx.commit()?;
        }
        debug!("Inserted {} row(s) into {}", prepared.len(), table);
        self.publish_all(table, ChangeKind::Insert, &prepared);
        Ok(prepared)
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<Vec<Row>, StoreError> {
        let updated = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut rows = Self::matching(&tx, table, filters)?;
            for row in rows.iter_mut() {
                table.apply_patch(row, &patch);
                Self::write_existing(&tx, table, row)?;
            }
            tx.commit()?;
            rows
        };
        self.publish_all(table, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn upsert(&self, table: Table, row: Row, conflict: &[&str]) -> Result<Row, StoreError> {
        let filters: Vec<Filter> = conflict
            .iter()
            .map(|c| match row.get(*c) {
                Some(v) if !v.is_null() => Filter::eq(c, v.clone()),
                _ => Filter::is_null(c),
            })
            .collect();

        let (written, kind) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let existing = Self::matching(&tx, table, &filters)?.into_iter().next();
            let result = match existing {
                Some(mut current) => {
                    table.apply_patch(&mut current, &row);
                    Self::write_existing(&tx, table, &current)?;
                    (current, ChangeKind::Update)
                }
                None => {
                    let prepared = table.prepare_insert(row);
                    Self::write_new(&tx, table, &prepared)?;
                    (prepared, ChangeKind::Insert)
                }
            };
            tx.commit()?;
            result
        };
        self.publish_all(table, kind, std::slice::from_ref(&written));
        Ok(written)
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<usize, StoreError> {
        let removed = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let rows = Self::matching(&tx, table, filters)?;
            for row in &rows {
                tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table.as_str()), params![row_id(row)])?;
            }
            tx.commit()?;
            rows
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names_are_validated() {
        assert!(column_expr("conversation_id").is_ok());
        assert!(column_expr("id'); DROP TABLE profiles; --").is_err());
        assert!(column_expr("").is_err());
    }

    #[test]
    fn test_where_clause_with_empty_in_list_matches_nothing() {
        let (sql, values) = where_clause(&[Filter::in_list::<Value>("id", Vec::new())]).unwrap();
        assert_eq!(sql, "WHERE 0");
        assert!(values.is_empty());
    }

    #[test]
    fn test_conflicts_name_the_violated_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let status = Table::MessageStatus.prepare_insert(super::super::make_row([
            ("message_id", Value::from("m")),
            ("user_id", Value::from("u")),
        ]));
        let mut again = status.clone();
        again.insert("id".to_string(), Value::from("another-id"));

        conn.execute(
            "INSERT INTO message_status (id, body) VALUES (?1, ?2)",
            params![row_id(&status), serde_json::to_string(&status).unwrap()],
        )
        .unwrap();
        let err = conn
            .execute(
                "INSERT INTO message_status (id, body) VALUES (?1, ?2)",
                params![row_id(&again), serde_json::to_string(&again).unwrap()],
            )
            .unwrap_err();
        match map_constraint(err, Table::MessageStatus, &again) {
            StoreError::Conflict { key, .. } => assert_eq!(key, "message_id=\"m\",user_id=\"u\""),
            other => panic!("unexpected error: {}", other),
        }

        let err = conn
            .execute(
                "INSERT INTO profiles (id, body) VALUES ('p', '{}'), ('p', '{}')",
                [],
            )
            .unwrap_err();
        match map_constraint(err, Table::Profiles, &super::super::make_row([("id", Value::from("p"))])) {
            StoreError::Conflict { key, .. } => assert_eq!(key, "id=\"p\""),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_bool_filters_bind_as_integers() {
        let (sql, values) = where_clause(&[Filter::eq("is_group", false)]).unwrap();
        assert_eq!(sql, "WHERE json_extract(body, '$.is_group') = ?");
        assert_eq!(values, vec![SqlValue::Integer(0)]);
    }
}
