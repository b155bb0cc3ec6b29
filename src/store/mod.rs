// Remote store boundary
// Rows travel as JSON objects; typed models are decoded at the sync layer.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::StoreError;
use crate::models::ts;

pub mod feed;
pub mod memory;
pub mod sqlite;

pub use feed::ChangeFeed;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type Row = serde_json::Map<String, Value>;
pub type SharedStore = Arc<dyn RemoteStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    Conversations,
    ConversationParticipants,
    Messages,
    MessageStatus,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Profiles,
        Table::Conversations,
        Table::ConversationParticipants,
        Table::Messages,
        Table::MessageStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Conversations => "conversations",
            Table::ConversationParticipants => "conversation_participants",
            Table::Messages => "messages",
            Table::MessageStatus => "message_status",
        }
    }

    /// Column stamped with the insert time.
    pub fn created_column(&self) -> &'static str {
        match self {
            Table::ConversationParticipants => "joined_at",
            _ => "created_at",
        }
    }

    pub fn has_updated_at(&self) -> bool {
        !matches!(self, Table::ConversationParticipants)
    }

    /// Column sets that must be unique besides `id`.
    pub fn unique_keys(&self) -> &'static [&'static [&'static str]] {
        match self {
            Table::MessageStatus => &[&["message_id", "user_id"]],
            _ => &[],
        }
    }

    /// Values filled in on insert when the caller leaves them out.
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        match self {
            Table::Profiles => vec![
                ("avatar_url", Value::Null),
                ("status", Value::Null),
                ("is_online", Value::Bool(false)),
                ("last_seen", Value::Null),
            ],
            Table::Conversations => vec![("name", Value::Null), ("is_group", Value::Bool(false))],
            Table::ConversationParticipants => vec![
                ("left_at", Value::Null),
                ("role", Value::String("member".to_string())),
            ],
            Table::Messages => vec![
                ("message_type", Value::String("text".to_string())),
                ("reply_to", Value::Null),
            ],
            Table::MessageStatus => vec![("status", Value::String("delivered".to_string()))],
        }
    }

    /// Fills id, audit timestamps and column defaults for a new row.
    pub fn prepare_insert(&self, mut row: Row) -> Row {
        let now = Value::String(ts::now());
        if !matches!(row.get("id"), Some(Value::String(_))) {
            row.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        row.entry(self.created_column().to_string()).or_insert_with(|| now.clone());
        if self.has_updated_at() {
            row.entry("updated_at".to_string()).or_insert_with(|| now.clone());
        }
        for (column, value) in self.defaults() {
            row.entry(column.to_string()).or_insert(value);
        }
        row
    }

    /// Merges `patch` into `row`, refreshing `updated_at` unless the patch sets it.
    pub fn apply_patch(&self, row: &mut Row, patch: &Row) {
        for (column, value) in patch {
            if column != "id" {
                row.insert(column.clone(), value.clone());
            }
        }
        if self.has_updated_at() && !patch.contains_key("updated_at") {
            row.insert("updated_at".to_string(), Value::String(ts::now()));
        }
    }

    /// Human readable key of `row` for the given column set, used in conflict errors.
    pub fn describe_key(&self, row: &Row, columns: &[&str]) -> String {
        columns
            .iter()
            .map(|c| format!("{}={}", c, row.get(*c).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation kinds, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Query,
    Insert,
    Update,
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    IsNull,
    NotNull,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter { column: column.to_string(), op: FilterOp::Eq, value: value.into() }
    }

    pub fn neq(column: &str, value: impl Into<Value>) -> Self {
        Filter { column: column.to_string(), op: FilterOp::Neq, value: value.into() }
    }

    pub fn is_null(column: &str) -> Self {
        Filter { column: column.to_string(), op: FilterOp::IsNull, value: Value::Null }
    }

    pub fn not_null(column: &str) -> Self {
        Filter { column: column.to_string(), op: FilterOp::NotNull, value: Value::Null }
    }

    pub fn in_list<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter {
            column: column.to_string(),
            op: FilterOp::In,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        }
    }

    /// SQL-style matching: comparisons against a missing or null column are false.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => !actual.is_null() && actual == &self.value,
            FilterOp::Neq => !actual.is_null() && actual != &self.value,
            FilterOp::IsNull => actual.is_null(),
            FilterOp::NotNull => !actual.is_null(),
            FilterOp::In => match &self.value {
                Value::Array(values) => !actual.is_null() && values.contains(actual),
                _ => false,
            },
        }
    }
}

pub fn matches_all(filters: &[Filter], row: &Row) -> bool {
    filters.iter().all(|f| f.matches(row))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Total order over JSON scalars: null < bool < number < string.
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
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

pub fn compare_rows(order: &[Order], a: &Row, b: &Row) -> Ordering {
    for o in order {
        let left = a.get(&o.column).unwrap_or(&Value::Null);
        let right = b.get(&o.column).unwrap_or(&Value::Null);
        let ord = compare_values(left, right);
        let ord = if o.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// An embedded relation: rows of `table` whose `foreign` column equals the
/// parent's `local` column, stored on the parent under `alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub alias: String,
    pub table: Table,
    pub local: String,
    pub foreign: String,
    pub many: bool,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub joins: Vec<Join>,
}

impl Join {
    pub fn one(alias: &str, table: Table, local: &str, foreign: &str) -> Self {
        Join {
            alias: alias.to_string(),
            table,
            local: local.to_string(),
            foreign: foreign.to_string(),
            many: false,
            filters: Vec::new(),
            order: Vec::new(),
            joins: Vec::new(),
        }
    }

    pub fn many(alias: &str, table: Table, local: &str, foreign: &str) -> Self {
        Join { many: true, ..Join::one(alias, table, local, foreign) }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order { column: column.to_string(), ascending });
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub joins: Vec<Join>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    /// Keep only the first row (after ordering) for each value of this column.
    pub distinct_on: Option<String>,
}

impl Query {
    pub fn table(table: Table) -> Self {
        Query {
            table,
            filters: Vec::new(),
            joins: Vec::new(),
            order: Vec::new(),
            limit: None,
            distinct_on: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order { column: column.to_string(), ascending });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn distinct_on(mut self, column: &str) -> Self {
        self.distinct_on = Some(column.to_string());
        self
    }

    /// Filtering, ordering, distinct and limit over already loaded rows.
    pub fn apply_local(&self, rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
        let mut selected: Vec<Row> = rows
            .into_iter()
            .filter(|row| matches_all(&self.filters, row))
            .collect();
        selected.sort_by(|a, b| compare_rows(&self.order, a, b));
        if let Some(column) = &self.distinct_on {
            let mut seen = HashSet::new();
            selected.retain(|row| seen.insert(row.get(column).unwrap_or(&Value::Null).to_string()));
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    All,
}

impl EventFilter {
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
            EventFilter::Delete => kind == ChangeKind::Delete,
        }
    }
}

/// A row-level change. For deletes `row` holds the removed row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub row: Row,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a push subscription. Must be handed back through
/// `RemoteStore::unsubscribe` when its owner goes away.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub fn into_stream(self) -> UnboundedReceiverStream<ChangeEvent> {
        UnboundedReceiverStream::new(self.events)
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError>;

    /// Inserts every row or none of them.
    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError>;

    /// Applies `patch` to every row matching `filters`; returns the rows as
    /// written. An empty result means nothing matched.
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<Vec<Row>, StoreError>;

    async fn upsert(&self, table: Table, row: Row, conflict: &[&str]) -> Result<Row, StoreError>;

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<usize, StoreError>;

    fn subscribe(&self, table: Table, events: EventFilter, row_filter: Option<Filter>) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Resolves embedded relations with one `in` query per join level.
pub async fn resolve_joins<S>(store: &S, rows: &mut [Row], joins: &[Join]) -> Result<(), StoreError>
where
    S: RemoteStore + ?Sized,
{
    for join in joins {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for row in rows.iter() {
            if let Some(value) = row.get(&join.local) {
                if !value.is_null() && seen.insert(value.to_string()) {
                    keys.push(value.clone());
                }
            }
        }

        let mut grouped: HashMap<String, Vec<Row>> = HashMap::new();
        if !keys.is_empty() {
            let mut child = Query::table(join.table);
            child.filters = join.filters.clone();
            child.filters.push(Filter::in_list(&join.foreign, keys));
            child.joins = join.joins.clone();
            child.order = join.order.clone();
            for row in store.query(&child).await? {
                let key = row.get(&join.foreign).unwrap_or(&Value::Null).to_string();
                grouped.entry(key).or_default().push(row);
            }
        }

        for row in rows.iter_mut() {
            let key = row.get(&join.local).unwrap_or(&Value::Null).to_string();
            let matched = grouped.get(&key).cloned().unwrap_or_default();
            let value = if join.many {
                Value::Array(matched.into_iter().map(Value::Object).collect())
            } else {
                matched.into_iter().next().map(Value::Object).unwrap_or(Value::Null)
            };
            row.insert(join.alias.clone(), value);
        }
    }
    Ok(())
}

pub fn decode<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Builds a row from `(column, value)` pairs.
pub fn make_row<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_filters_follow_sql_null_semantics() {
        let r = obj(json!({"a": "x", "b": null}));
        assert!(Filter::eq("a", "x").matches(&r));
        assert!(!Filter::neq("b", "x").matches(&r));
        assert!(!Filter::neq("missing", "x").matches(&r));
        assert!(Filter::is_null("b").matches(&r));
        assert!(Filter::is_null("missing").matches(&r));
        assert!(Filter::not_null("a").matches(&r));
        assert!(Filter::in_list("a", ["y", "x"]).matches(&r));
        assert!(!Filter::in_list("b", [Value::Null]).matches(&r));
    }

    #[test]
    fn test_apply_local_orders_and_keeps_first_per_group() {
        let rows = vec![
            obj(json!({"c": "1", "t": "2024-01-01T00:00:01.000000Z", "id": "b"})),
            obj(json!({"c": "1", "t": "2024-01-01T00:00:03.000000Z", "id": "a"})),
            obj(json!({"c": "2", "t": "2024-01-01T00:00:02.000000Z", "id": "c"})),
        ];
        let query = Query::table(Table::Messages)
            .order_by("t", false)
            .order_by("id", false)
            .distinct_on("c");
        let out = query.apply_local(rows);
        let ids: Vec<_> = out.iter().map(|r| r["id"].as_str().unwrap_or_default().to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_prepare_insert_stamps_defaults() {
        let prepared = Table::ConversationParticipants.prepare_insert(make_row([
            ("conversation_id", json!("c")),
            ("user_id", json!("u")),
        ]));
        assert!(prepared["id"].is_string());
        assert!(prepared["joined_at"].is_string());
        assert!(prepared["left_at"].is_null());
        assert_eq!(prepared["role"], json!("member"));
        assert!(!prepared.contains_key("updated_at"));
    }
}
