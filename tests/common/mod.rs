// Common test utilities for integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{info, LevelFilter};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

use parley::store::{make_row, RemoteStore, Row, Table};
use parley::SyncNotice;

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

pub fn row_id(row: &Row) -> Uuid {
    row.get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("row has a uuid id")
}

pub async fn add_profile(store: &dyn RemoteStore, username: &str, display_name: &str) -> Uuid {
    let row = store
        .insert(
            Table::Profiles,
            make_row([("username", json!(username)), ("full_name", json!(display_name))]),
        )
        .await
        .expect("insert profile");
    row_id(&row)
}

/// Conversation with the given members, written row by row. More than two
/// members makes it a group.
pub async fn add_conversation(store: &dyn RemoteStore, creator: Uuid, members: &[Uuid]) -> Uuid {
    let conversation = store
        .insert(
            Table::Conversations,
            make_row([
                ("is_group", json!(members.len() > 2)),
                ("created_by", json!(creator.to_string())),
            ]),
        )
        .await
        .expect("insert conversation");
    let id = row_id(&conversation);
    for member in members {
        store
            .insert(
                Table::ConversationParticipants,
                make_row([
                    ("conversation_id", json!(id.to_string())),
                    ("user_id", json!(member.to_string())),
                ]),
            )
            .await
            .expect("insert participant");
    }
    id
}

/// Polls `check` until it returns true or `timeout_ms` elapses.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(Duration::from_millis(timeout_ms), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    polled.map_err(|_| anyhow!("condition not met within {}ms", timeout_ms))
}

pub async fn wait_for_notice(
    rx: &mut broadcast::Receiver<SyncNotice>,
    predicate: impl Fn(&SyncNotice) -> bool,
    timeout_secs: u64,
) -> Result<SyncNotice> {
    info!("Waiting for notice...");
    match timeout(Duration::from_secs(timeout_secs), async {
        loop {
            match rx.recv().await {
                Ok(notice) if predicate(&notice) => return Ok(notice),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(anyhow!("Notice channel closed")),
            }
        }
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Timed out waiting for notice")),
    }
}
