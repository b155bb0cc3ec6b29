// Message stream
// Ordered timeline of one conversation with sender profiles and receipts.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::receipts::{self, StatusOutcome, StatusPolicy};
use super::{notify, RefreshGate, SyncNotice, SyncTask};
use crate::error::{StoreError, SyncError};
use crate::identity::SessionContext;
use crate::models::{DeliveryStatus, Message, MessageKind, MessageStatus, MessageWithDetails, Participant};
use crate::store::{
    decode, make_row, ChangeEvent, ChangeKind, EventFilter, Filter, Join, Query, RemoteStore, Row, SharedStore, Table,
};

/// Outgoing message as composed by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<Uuid>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        NewMessage {
            content: content.into(),
            kind: MessageKind::Text,
            reply_to: None,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn reply_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

fn with_details(query: Query) -> Query {
    query
        .join(Join::one("sender", Table::Profiles, "sender_id", "id"))
        .join(Join::many("message_status", Table::MessageStatus, "id", "message_id").order_by("user_id", true))
}

/// Timeline of `conversation_id`, ascending by (created_at, id).
pub async fn list_messages(store: &dyn RemoteStore, conversation_id: Uuid) -> Result<Vec<MessageWithDetails>, StoreError> {
    let query = with_details(
        Query::table(Table::Messages)
            .filter(Filter::eq("conversation_id", conversation_id.to_string()))
            .order_by("created_at", true)
            .order_by("id", true),
    );
    let rows = store.query(&query).await?;
    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        match decode::<MessageWithDetails>(row) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping undecodable message row: {}", e),
        }
    }
    Ok(messages)
}

pub async fn fetch_message(store: &dyn RemoteStore, message_id: Uuid) -> Result<Option<MessageWithDetails>, StoreError> {
    let query = with_details(Query::table(Table::Messages).filter(Filter::eq("id", message_id.to_string())).limit(1));
    store
        .query(&query)
        .await?
        .into_iter()
        .next()
        .map(decode::<MessageWithDetails>)
        .transpose()
}

pub async fn active_participants(store: &dyn RemoteStore, conversation_id: Uuid) -> Result<Vec<Participant>, StoreError> {
    let rows = store
        .query(
            &Query::table(Table::ConversationParticipants)
                .filter(Filter::eq("conversation_id", conversation_id.to_string()))
                .filter(Filter::is_null("left_at"))
                .order_by("joined_at", true),
        )
        .await?;
    rows.into_iter().map(decode::<Participant>).collect()
}

/// Inserts the message, then one `delivered` receipt per other active
/// participant. If the receipts cannot be written the message is deleted
/// again and `PartialWrite` is returned.
pub async fn send_message(
    store: &dyn RemoteStore,
    sender_id: Uuid,
    conversation_id: Uuid,
    message: NewMessage,
) -> Result<MessageWithDetails, SyncError> {
    if message.content.trim().is_empty() {
        return Err(SyncError::InvalidArgument("message content is empty".to_string()));
    }

    let participants = active_participants(store, conversation_id).await?;
    if !participants.iter().any(|p| p.user_id == sender_id) {
        return Err(SyncError::NotParticipant {
            conversation_id,
            user_id: sender_id,
        });
    }

    let row = make_row([
        ("conversation_id", json!(conversation_id.to_string())),
        ("sender_id", json!(sender_id.to_string())),
        ("content", json!(message.content)),
        ("message_type", json!(message.kind.as_str())),
        ("reply_to", message.reply_to.map(|id| json!(id.to_string())).unwrap_or(Value::Null)),
    ]);
    let stored: Message = decode(store.insert(Table::Messages, row).await?)?;

    let mut seen = HashSet::new();
    let recipients: Vec<Uuid> = participants
        .iter()
        .map(|p| p.user_id)
        .filter(|u| *u != sender_id && seen.insert(*u))
        .collect();

    match receipts::fan_out_delivered(store, &stored, &recipients).await {
        Ok(statuses) => {
            info!(
                "Sent message {} to conversation {} ({} recipient(s))",
                stored.id,
                conversation_id,
                statuses.len()
            );
            Ok(MessageWithDetails {
                message: stored,
                sender: None,
                statuses,
            })
        }
        Err(source) => {
            let compensated = remove_message(store, stored.id).await;
            if compensated {
                warn!("Receipt fan-out for {} failed, message withdrawn: {}", stored.id, source);
            } else {
                error!("Receipt fan-out for {} failed and message {} is orphaned: {}", stored.id, stored.id, source);
            }
            Err(SyncError::PartialWrite {
                step: "receipt fan-out",
                compensated,
                source,
            })
        }
    }
}

async fn remove_message(store: &dyn RemoteStore, message_id: Uuid) -> bool {
    let id = message_id.to_string();
    if let Err(e) = store.delete(Table::MessageStatus, &[Filter::eq("message_id", id.clone())]).await {
        error!("Failed to delete receipts of {}: {}", message_id, e);
        return false;
    }
    match store.delete(Table::Messages, &[Filter::eq("id", id)]).await {
        Ok(_) => true,
        Err(e) => {
            error!("Failed to delete message {}: {}", message_id, e);
            false
        }
    }
}

fn row_uuid(row: &Row, column: &str) -> Option<Uuid> {
    row.get(column).and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
}

#[derive(Default)]
struct TimelineCache {
    messages: Vec<MessageWithDetails>,
    gate: RefreshGate,
    loading: bool,
}

impl TimelineCache {
    /// Inserts at the sorted position; a message already present is
    /// replaced in place.
    fn insert_sorted(&mut self, message: MessageWithDetails) -> bool {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id() == message.id()) {
            if *existing == message {
                return false;
            }
            // Keep receipts we already know about if the incoming copy has none.
            let statuses = if message.statuses.is_empty() {
                std::mem::take(&mut existing.statuses)
            } else {
                message.statuses
            };
            let sender = message.sender.or_else(|| existing.sender.take());
            *existing = MessageWithDetails {
                message: message.message,
                sender,
                statuses,
            };
            return true;
        }
        let key = message.ordering_key();
        let index = self.messages.partition_point(|m| m.ordering_key() < key);
        self.messages.insert(index, message);
        true
    }

    fn remove(&mut self, message_id: Uuid) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id() != message_id);
        self.messages.len() != before
    }

    fn apply_status(&mut self, status: MessageStatus) -> bool {
        let message = match self.messages.iter_mut().find(|m| m.id() == status.message_id) {
            Some(message) => message,
            None => return false,
        };
        match message.statuses.iter_mut().find(|s| s.user_id == status.user_id) {
            Some(existing) if existing.updated_at > status.updated_at || *existing == status => false,
            Some(existing) => {
                *existing = status;
                true
            }
            None => {
                message.statuses.push(status);
                message.statuses.sort_by_key(|s| s.user_id);
                true
            }
        }
    }

    fn remove_status(&mut self, message_id: Uuid, status_id: Uuid) -> bool {
        match self.messages.iter_mut().find(|m| m.id() == message_id) {
            Some(message) => {
                let before = message.statuses.len();
                message.statuses.retain(|s| s.id != status_id);
                message.statuses.len() != before
            }
            None => false,
        }
    }

    /// Replaces the timeline with a fetched one, keeping messages that
    /// arrived by push after the fetch was issued. Cached receipts newer than
    /// the fetched ones win, as do receipts pushed after the fetch was issued.
    fn replace(&mut self, fetched: Vec<MessageWithDetails>, issued_at: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.messages, fetched);
        self.messages.sort_by_key(|m| m.ordering_key());
        for message in previous {
            if !self.messages.iter().any(|m| m.id() == message.id()) {
                if message.message.created_at >= issued_at {
                    self.insert_sorted(message);
                }
                continue;
            }
            for status in message.statuses {
                let known = self
                    .messages
                    .iter()
                    .find(|m| m.id() == status.message_id)
                    .map_or(false, |m| m.statuses.iter().any(|s| s.user_id == status.user_id));
                if known || status.updated_at >= issued_at {
                    self.apply_status(status);
                }
            }
        }
    }
}

struct StreamShared {
    store: SharedStore,
    conversation_id: Uuid,
    cache: Mutex<TimelineCache>,
    notices: broadcast::Sender<SyncNotice>,
}

impl StreamShared {
    fn changed(&self) {
        notify(
            &self.notices,
            SyncNotice::MessagesChanged {
                conversation_id: self.conversation_id,
            },
        );
    }

    async fn refresh(&self) -> bool {
        let (ticket, issued_at) = {
            let mut cache = self.cache.lock().await;
            cache.loading = true;
            (cache.gate.begin(), Utc::now())
        };

        let result = list_messages(&*self.store, self.conversation_id).await;

        let mut cache = self.cache.lock().await;
        cache.loading = false;
        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("Error fetching messages of {}: {}", self.conversation_id, e);
                return false;
            }
        };
        if !cache.gate.commit(ticket) {
            debug!("Discarding message refresh #{} of {}", ticket, self.conversation_id);
            return false;
        }
        cache.replace(fetched, issued_at);
        debug!("Timeline of {} holds {} message(s)", self.conversation_id, cache.messages.len());
        drop(cache);
        self.changed();
        true
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let changed = match (event.table, event.kind) {
            (Table::Messages, ChangeKind::Delete) => match row_uuid(&event.row, "id") {
                Some(id) => self.cache.lock().await.remove(id),
                None => false,
            },
            (Table::Messages, _) => {
                let id = match row_uuid(&event.row, "id") {
                    Some(id) => id,
                    None => return,
                };
                let message = match fetch_message(&*self.store, id).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        debug!("Message {} vanished before it could be fetched", id);
                        return;
                    }
                    Err(e) => {
                        warn!("Falling back to event payload for message {}: {}", id, e);
                        match decode::<Message>(event.row) {
                            Ok(message) => MessageWithDetails::bare(message),
                            Err(e) => {
                                error!("Undecodable message event: {}", e);
                                return;
                            }
                        }
                    }
                };
                self.cache.lock().await.insert_sorted(message)
            }
            (Table::MessageStatus, ChangeKind::Delete) => {
                match (row_uuid(&event.row, "message_id"), row_uuid(&event.row, "id")) {
                    (Some(message_id), Some(status_id)) => self.cache.lock().await.remove_status(message_id, status_id),
                    _ => false,
                }
            }
            (Table::MessageStatus, _) => match decode::<MessageStatus>(event.row) {
                Ok(status) => self.cache.lock().await.apply_status(status),
                Err(e) => {
                    warn!("Skipping undecodable status event: {}", e);
                    false
                }
            },
            _ => false,
        };
        if changed {
            self.changed();
        }
    }
}

/// Live timeline of one conversation. Dropping it releases its subscriptions.
pub struct MessageStream {
    ctx: SessionContext,
    policy: StatusPolicy,
    shared: Arc<StreamShared>,
    _task: SyncTask,
}

impl MessageStream {
    pub async fn open(
        store: SharedStore,
        ctx: SessionContext,
        conversation_id: Uuid,
        policy: StatusPolicy,
        notices: broadcast::Sender<SyncNotice>,
    ) -> Self {
        let shared = Arc::new(StreamShared {
            store: store.clone(),
            conversation_id,
            cache: Mutex::new(TimelineCache::default()),
            notices,
        });

        let subscriptions = vec![
            store.subscribe(
                Table::Messages,
                EventFilter::All,
                Some(Filter::eq("conversation_id", conversation_id.to_string())),
            ),
            // Receipts carry no conversation id; unknown message ids are ignored.
            store.subscribe(Table::MessageStatus, EventFilter::All, None),
        ];
        let handler_state = shared.clone();
        let task = SyncTask::spawn("messages", store, subscriptions, move |event| {
            let shared = handler_state.clone();
            async move { shared.handle_event(event).await }
        });

        let stream = MessageStream {
            ctx,
            policy,
            shared,
            _task: task,
        };
        stream.refresh().await;
        stream
    }

    pub fn conversation_id(&self) -> Uuid {
        self.shared.conversation_id
    }

    pub async fn list(&self) -> Vec<MessageWithDetails> {
        self.shared.cache.lock().await.messages.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.shared.cache.lock().await.loading
    }

    pub async fn refresh(&self) -> bool {
        self.shared.refresh().await
    }

    pub async fn send(&self, content: &str) -> Result<MessageWithDetails, SyncError> {
        self.send_new(NewMessage::text(content)).await
    }

    pub async fn send_new(&self, message: NewMessage) -> Result<MessageWithDetails, SyncError> {
        let sent = send_message(&*self.shared.store, self.ctx.user_id, self.conversation_id(), message).await?;
        let changed = self.shared.cache.lock().await.insert_sorted(sent.clone());
        if changed {
            self.shared.changed();
        }
        Ok(sent)
    }

    /// Marks one message of this conversation read for the session user.
    /// Own messages are rejected.
    pub async fn mark_read(&self, message_id: Uuid) -> Result<StatusOutcome, SyncError> {
        let store = &*self.shared.store;
        let message = receipts::recipient_message(store, message_id, self.ctx.user_id).await?;
        if message.conversation_id != self.conversation_id() {
            return Err(SyncError::InvalidArgument(format!(
                "message {} belongs to conversation {}, not {}",
                message_id,
                message.conversation_id,
                self.conversation_id()
            )));
        }

        let outcome =
            receipts::write_status(store, self.policy, message_id, self.ctx.user_id, DeliveryStatus::Read).await?;
        receipts::log_read(&outcome, message_id, self.ctx.user_id);
        if let StatusOutcome::Applied(status) = &outcome {
            let changed = self.shared.cache.lock().await.apply_status(status.clone());
            if changed {
                self.shared.changed();
            }
        }
        Ok(outcome)
    }

    /// Marks every message from other senders that is not yet read. Returns
    /// how many were changed.
    pub async fn mark_all_read(&self) -> Result<usize, SyncError> {
        let pending: Vec<Uuid> = {
            let cache = self.shared.cache.lock().await;
            cache
                .messages
                .iter()
                .filter(|m| m.message.sender_id != self.ctx.user_id)
                .filter(|m| m.status_for(self.ctx.user_id) < DeliveryStatus::Read)
                .map(|m| m.id())
                .collect()
        };
        let mut marked = 0;
        for message_id in pending {
            if let StatusOutcome::Applied(_) = self.mark_read(message_id).await? {
                marked += 1;
            }
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(at: DateTime<Utc>, id: Uuid) -> MessageWithDetails {
        MessageWithDetails::bare(Message {
            id,
            conversation_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            content: "x".to_string(),
            message_type: MessageKind::Text,
            reply_to: None,
            created_at: at,
            updated_at: at,
        })
    }

    #[test]
    fn test_insert_sorted_handles_out_of_order_and_duplicates() {
        let t0 = Utc::now();
        let mut ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let mut cache = TimelineCache::default();

        assert!(cache.insert_sorted(message(t0 + Duration::seconds(2), ids[0])));
        assert!(cache.insert_sorted(message(t0, ids[2])));
        assert!(cache.insert_sorted(message(t0, ids[1])));
        assert!(!cache.insert_sorted(message(t0, ids[1])));

        let order: Vec<Uuid> = cache.messages.iter().map(|m| m.id()).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn test_status_updates_apply_to_known_messages_only() {
        let t0 = Utc::now();
        let id = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let mut cache = TimelineCache::default();
        cache.insert_sorted(message(t0, id));

        let mut status = MessageStatus {
            id: Uuid::new_v4(),
            message_id: id,
            user_id: reader,
            status: DeliveryStatus::Delivered,
            created_at: t0,
            updated_at: t0,
        };
        assert!(cache.apply_status(status.clone()));

        status.status = DeliveryStatus::Read;
        status.updated_at = t0 + Duration::seconds(1);
        assert!(cache.apply_status(status.clone()));

        let stale = MessageStatus {
            status: DeliveryStatus::Delivered,
            updated_at: t0,
            ..status.clone()
        };
        assert!(!cache.apply_status(stale));
        assert_eq!(cache.messages[0].status_for(reader), DeliveryStatus::Read);

        assert!(!cache.apply_status(MessageStatus {
            message_id: Uuid::new_v4(),
            ..status
        }));
    }

    #[test]
    fn test_replace_keeps_receipts_pushed_during_fetch() {
        let t0 = Utc::now();
        let (id, bob, dee) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let receipt = |user_id, status, at| MessageStatus {
            id: Uuid::new_v4(),
            message_id: id,
            user_id,
            status,
            created_at: t0,
            updated_at: at,
        };
        let mut cache = TimelineCache::default();
        let mut cached = message(t0, id);
        cached.statuses = vec![
            receipt(bob, DeliveryStatus::Read, t0 + Duration::seconds(3)),
            receipt(dee, DeliveryStatus::Read, t0 + Duration::seconds(3)),
        ];
        cache.insert_sorted(cached);

        // Snapshot taken before both reads landed; it never saw dee's row.
        let mut fetched = message(t0, id);
        fetched.statuses = vec![receipt(bob, DeliveryStatus::Delivered, t0 + Duration::seconds(1))];
        cache.replace(vec![fetched], t0 + Duration::seconds(2));

        let statuses = &cache.messages[0].statuses;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.status == DeliveryStatus::Read));

        // Receipts older than the fetch and absent from it are not resurrected.
        let mut stale = message(t0, id);
        stale.statuses = vec![receipt(bob, DeliveryStatus::Read, t0 + Duration::seconds(3))];
        cache.replace(vec![stale], t0 + Duration::seconds(10));
        assert_eq!(cache.messages[0].statuses.len(), 1);
    }

    #[test]
    fn test_new_message_builder() {
        let parent = Uuid::new_v4();
        let m = NewMessage::text("look").with_kind(MessageKind::Image).reply_to(parent);
        assert_eq!(m.kind, MessageKind::Image);
        assert_eq!(m.reply_to, Some(parent));
    }
}
