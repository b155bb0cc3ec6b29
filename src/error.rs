use thiserror::Error;
use uuid::Uuid;

use crate::store::{StoreOp, Table};

/// Failures surfaced by a `RemoteStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query on {table} failed: {reason}")]
    Query { table: Table, reason: String },

    #[error("write to {table} failed: {reason}")]
    Write { table: Table, reason: String },

    #[error("conflict on {table}: {key}")]
    Conflict { table: Table, key: String },

    #[error("no matching row in {table}")]
    NotFound { table: Table },

    #[error("injected {op:?} failure on {table}")]
    Injected { table: Table, op: StoreOp },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Failures returned by the write operations of the sync components.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("user {user_id} is not an active participant of conversation {conversation_id}")]
    NotParticipant { conversation_id: Uuid, user_id: Uuid },

    #[error("{step} failed after a partial write (compensated: {compensated}): {source}")]
    PartialWrite {
        step: &'static str,
        compensated: bool,
        #[source]
        source: StoreError,
    },

    #[error("no active session")]
    NoSession,

    #[error("no conversation selected")]
    NoConversation,
}
