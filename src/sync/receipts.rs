// Delivery and read receipts
// Status fan-out at send time and the sent -> delivered -> read transitions.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{StoreError, SyncError};
use crate::models::{DeliveryStatus, Message, MessageStatus};
use super::messages::active_participants;
use crate::store::{decode, make_row, Filter, Query, RemoteStore, Table};

const STATUS_KEY: [&str; 2] = ["message_id", "user_id"];
const CAS_ATTEMPTS: usize = 2;

/// How status writes treat an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// Only ever move a status forward (compare-and-swap).
    #[default]
    Monotonic,
    /// Unconditional upsert; a late `delivered` can overwrite `read`.
    LastWriteWins,
}

impl FromStr for StatusPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "monotonic" => Ok(StatusPolicy::Monotonic),
            "last_write_wins" | "lww" => Ok(StatusPolicy::LastWriteWins),
            other => Err(format!("unknown status policy '{}'", other)),
        }
    }
}

impl fmt::Display for StatusPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusPolicy::Monotonic => f.write_str("monotonic"),
            StatusPolicy::LastWriteWins => f.write_str("last_write_wins"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// The row now holds the requested status.
    Applied(MessageStatus),
    /// The stored status was already at or past the requested one.
    Unchanged(DeliveryStatus),
}

impl StatusOutcome {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            StatusOutcome::Applied(row) => row.status,
            StatusOutcome::Unchanged(status) => *status,
        }
    }
}

fn key_filters(message_id: Uuid, user_id: Uuid) -> [Filter; 2] {
    [
        Filter::eq("message_id", message_id.to_string()),
        Filter::eq("user_id", user_id.to_string()),
    ]
}

/// Creates one `delivered` row per recipient in a single all-or-nothing write.
pub async fn fan_out_delivered(
    store: &dyn RemoteStore,
    message: &Message,
    recipients: &[Uuid],
) -> Result<Vec<MessageStatus>, StoreError> {
    let rows: Vec<_> = recipients
        .iter()
        .filter(|r| **r != message.sender_id)
        .map(|recipient| {
            make_row([
                ("message_id", json!(message.id.to_string())),
                ("user_id", json!(recipient.to_string())),
                ("status", json!(DeliveryStatus::Delivered.as_str())),
            ])
        })
        .collect();
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let written = store.insert_many(Table::MessageStatus, rows).await?;
    debug!("Fanned out {} delivery receipt(s) for message {}", written.len(), message.id);
    written.into_iter().map(decode::<MessageStatus>).collect()
}

/// Loads `message_id` and checks that `user_id` is one of its recipients:
/// not the sender, and an active participant of its conversation.
pub async fn recipient_message(store: &dyn RemoteStore, message_id: Uuid, user_id: Uuid) -> Result<Message, SyncError> {
    let row = store
        .query(&Query::table(Table::Messages).filter(Filter::eq("id", message_id.to_string())).limit(1))
        .await?
        .into_iter()
        .next()
        .ok_or(StoreError::NotFound { table: Table::Messages })?;
    let message: Message = decode(row)?;

    if message.sender_id == user_id {
        return Err(SyncError::InvalidArgument(format!(
            "message {} was sent by {} and has no receipt for them",
            message_id, user_id
        )));
    }
    let participants = active_participants(store, message.conversation_id).await?;
    if !participants.iter().any(|p| p.user_id == user_id) {
        return Err(SyncError::NotParticipant {
            conversation_id: message.conversation_id,
            user_id,
        });
    }
    Ok(message)
}

/// Moves the (message, user) status to `target` according to `policy`.
/// Only recipients of the message have a status row.
pub async fn record_status(
    store: &dyn RemoteStore,
    policy: StatusPolicy,
    message_id: Uuid,
    user_id: Uuid,
    target: DeliveryStatus,
) -> Result<StatusOutcome, SyncError> {
    recipient_message(store, message_id, user_id).await?;
    write_status(store, policy, message_id, user_id, target).await
}

/// Status write without the recipient check.
pub(crate) async fn write_status(
    store: &dyn RemoteStore,
    policy: StatusPolicy,
    message_id: Uuid,
    user_id: Uuid,
    target: DeliveryStatus,
) -> Result<StatusOutcome, SyncError> {
    if target == DeliveryStatus::Sent {
        return Err(SyncError::InvalidArgument("'sent' is implicit and cannot be stored".to_string()));
    }

    if policy == StatusPolicy::LastWriteWins {
        let row = make_row([
            ("message_id", json!(message_id.to_string())),
            ("user_id", json!(user_id.to_string())),
            ("status", json!(target.as_str())),
        ]);
        let written = store.upsert(Table::MessageStatus, row, &STATUS_KEY).await?;
        return Ok(StatusOutcome::Applied(decode(written)?));
    }

    let lower: Vec<String> = target.lower_stored().iter().map(|s| s.as_str().to_string()).collect();
    for attempt in 0..CAS_ATTEMPTS {
        // Forward-only update of an existing row.
        if !lower.is_empty() {
            let mut filters = key_filters(message_id, user_id).to_vec();
            filters.push(Filter::in_list("status", lower.clone()));
            let updated = store
                .update(Table::MessageStatus, &filters, make_row([("status", json!(target.as_str()))]))
                .await?;
            if let Some(row) = updated.into_iter().next() {
                return Ok(StatusOutcome::Applied(decode(row)?));
            }
        }

        if let Some(current) = fetch_status(store, message_id, user_id).await? {
            if current.status >= target {
                debug!(
                    "Status of {} for {} already {}, not moving to {}",
                    message_id,
                    user_id,
                    current.status.as_str(),
                    target.as_str()
                );
                return Ok(StatusOutcome::Unchanged(current.status));
            }
            // Lower row appeared between the update and the read.
            continue;
        }

        let row = make_row([
            ("message_id", json!(message_id.to_string())),
            ("user_id", json!(user_id.to_string())),
            ("status", json!(target.as_str())),
        ]);
        match store.insert(Table::MessageStatus, row).await {
            Ok(written) => return Ok(StatusOutcome::Applied(decode(written)?)),
            Err(e) if e.is_conflict() => {
                warn!("Status row for {}/{} created concurrently (attempt {})", message_id, user_id, attempt + 1);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StoreError::Conflict {
        table: Table::MessageStatus,
        key: format!("message_id={},user_id={}", message_id, user_id),
    }
    .into())
}

pub async fn mark_read(
    store: &dyn RemoteStore,
    policy: StatusPolicy,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<StatusOutcome, SyncError> {
    let outcome = record_status(store, policy, message_id, user_id, DeliveryStatus::Read).await?;
    log_read(&outcome, message_id, user_id);
    Ok(outcome)
}

pub(crate) fn log_read(outcome: &StatusOutcome, message_id: Uuid, user_id: Uuid) {
    match outcome {
        StatusOutcome::Applied(_) => info!("Message {} marked read by {}", message_id, user_id),
        StatusOutcome::Unchanged(status) => {
            debug!("Message {} already {} for {}", message_id, status.as_str(), user_id)
        }
    }
}

pub async fn fetch_status(
    store: &dyn RemoteStore,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<Option<MessageStatus>, StoreError> {
    let [by_message, by_user] = key_filters(message_id, user_id);
    let rows = store
        .query(&Query::table(Table::MessageStatus).filter(by_message).filter(by_user).limit(1))
        .await?;
    rows.into_iter().next().map(decode::<MessageStatus>).transpose()
}

/// Effective status for (message, user); no row means `Sent`.
pub async fn status_of(store: &dyn RemoteStore, message_id: Uuid, user_id: Uuid) -> Result<DeliveryStatus, StoreError> {
    Ok(fetch_status(store, message_id, user_id)
        .await?
        .map(|s| s.status)
        .unwrap_or(DeliveryStatus::Sent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Row, StoreOp};

    fn uuid_of(row: &Row) -> Uuid {
        Uuid::parse_str(row["id"].as_str().unwrap()).unwrap()
    }

    /// Two-member conversation holding one message; returns (message, sender, recipient).
    async fn seed(store: &MemoryStore) -> (Uuid, Uuid, Uuid) {
        let (sender, recipient) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = store
            .insert(Table::Conversations, make_row([("created_by", json!(sender.to_string()))]))
            .await
            .unwrap();
        let conversation_id = uuid_of(&conversation);
        for member in [sender, recipient] {
            store
                .insert(
                    Table::ConversationParticipants,
                    make_row([
                        ("conversation_id", json!(conversation_id.to_string())),
                        ("user_id", json!(member.to_string())),
                    ]),
                )
                .await
                .unwrap();
        }
        let message = store
            .insert(
                Table::Messages,
                make_row([
                    ("conversation_id", json!(conversation_id.to_string())),
                    ("sender_id", json!(sender.to_string())),
                    ("content", json!("hi")),
                ]),
            )
            .await
            .unwrap();
        (uuid_of(&message), sender, recipient)
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("monotonic".parse::<StatusPolicy>(), Ok(StatusPolicy::Monotonic));
        assert_eq!("Last-Write-Wins".parse::<StatusPolicy>(), Ok(StatusPolicy::LastWriteWins));
        assert!("sometimes".parse::<StatusPolicy>().is_err());
        assert_eq!(StatusPolicy::default(), StatusPolicy::Monotonic);
    }

    #[tokio::test]
    async fn test_monotonic_never_regresses() {
        let store = MemoryStore::new();
        let (m, _, u) = seed(&store).await;

        mark_read(&store, StatusPolicy::Monotonic, m, u).await.unwrap();
        let late = record_status(&store, StatusPolicy::Monotonic, m, u, DeliveryStatus::Delivered)
            .await
            .unwrap();

        assert_eq!(late, StatusOutcome::Unchanged(DeliveryStatus::Read));
        assert_eq!(status_of(&store, m, u).await.unwrap(), DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn test_last_write_wins_regresses() {
        let store = MemoryStore::new();
        let (m, _, u) = seed(&store).await;

        mark_read(&store, StatusPolicy::LastWriteWins, m, u).await.unwrap();
        record_status(&store, StatusPolicy::LastWriteWins, m, u, DeliveryStatus::Delivered)
            .await
            .unwrap();

        assert_eq!(status_of(&store, m, u).await.unwrap(), DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_missing_row_reads_as_sent() {
        let store = MemoryStore::new();
        assert_eq!(
            status_of(&store, Uuid::new_v4(), Uuid::new_v4()).await.unwrap(),
            DeliveryStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_read_promotes_delivered_row_in_place() {
        let store = MemoryStore::new();
        let (m, _, u) = seed(&store).await;

        record_status(&store, StatusPolicy::Monotonic, m, u, DeliveryStatus::Delivered)
            .await
            .unwrap();
        let outcome = mark_read(&store, StatusPolicy::Monotonic, m, u).await.unwrap();

        assert_eq!(outcome.status(), DeliveryStatus::Read);
        assert_eq!(store.rows(Table::MessageStatus).len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_read_is_unchanged() {
        let store = MemoryStore::new();
        let (m, _, u) = seed(&store).await;

        assert!(matches!(
            mark_read(&store, StatusPolicy::Monotonic, m, u).await.unwrap(),
            StatusOutcome::Applied(_)
        ));
        assert_eq!(
            mark_read(&store, StatusPolicy::Monotonic, m, u).await.unwrap(),
            StatusOutcome::Unchanged(DeliveryStatus::Read)
        );
    }

    #[tokio::test]
    async fn test_only_recipients_get_a_status() {
        let store = MemoryStore::new();
        let (m, sender, _) = seed(&store).await;

        for policy in [StatusPolicy::Monotonic, StatusPolicy::LastWriteWins] {
            assert!(matches!(
                mark_read(&store, policy, m, sender).await,
                Err(SyncError::InvalidArgument(_))
            ));
            assert!(matches!(
                mark_read(&store, policy, m, Uuid::new_v4()).await,
                Err(SyncError::NotParticipant { .. })
            ));
        }
        assert!(matches!(
            mark_read(&store, StatusPolicy::Monotonic, Uuid::new_v4(), sender).await,
            Err(SyncError::Store(StoreError::NotFound { .. }))
        ));
        assert!(store.rows(Table::MessageStatus).is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let store = MemoryStore::new();
        let (m, _, u) = seed(&store).await;
        store.fail_next(Table::MessageStatus, StoreOp::Insert);
        let err = mark_read(&store, StatusPolicy::Monotonic, m, u).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Injected { .. })));
    }
}
