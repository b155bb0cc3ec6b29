// Conversation registry
// Discovers the viewer's conversations, finds or creates 1:1 conversations
// and tracks the newest message of each.

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::messages::fetch_message;
use super::{notify, RefreshGate, SyncNotice, SyncTask};
use crate::error::{StoreError, SyncError};
use crate::identity::SessionContext;
use crate::models::{Conversation, ConversationSummary, Message, MessageWithDetails, Profile};
use crate::store::{
    decode, make_row, ChangeEvent, ChangeKind, EventFilter, Filter, Join, Query, RemoteStore, Row, SharedStore, Table,
};

fn row_uuid(row: &Row, column: &str) -> Option<Uuid> {
    row.get(column).and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
}

/// Ids of the conversations `user_id` is an active participant of.
async fn active_conversation_ids(store: &dyn RemoteStore, user_id: Uuid) -> Result<Vec<Value>, StoreError> {
    let rows = store
        .query(
            &Query::table(Table::ConversationParticipants)
                .filter(Filter::eq("user_id", user_id.to_string()))
                .filter(Filter::is_null("left_at")),
        )
        .await?;
    let mut seen = HashSet::new();
    Ok(rows
        .into_iter()
        .filter_map(|mut row| row.remove("conversation_id"))
        .filter(|id| seen.insert(id.to_string()))
        .collect())
}

/// Every conversation the viewer belongs to, with active participants and
/// their profiles, and the newest message. Most recent activity first.
pub async fn fetch_conversations(store: &dyn RemoteStore, user_id: Uuid) -> Result<Vec<ConversationSummary>, StoreError> {
    let ids = active_conversation_ids(store, user_id).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let conversations = store
        .query(
            &Query::table(Table::Conversations)
                .filter(Filter::in_list("id", ids.clone()))
                .join(
                    Join::many("participants", Table::ConversationParticipants, "id", "conversation_id")
                        .filter(Filter::is_null("left_at"))
                        .order_by("joined_at", true)
                        .join(Join::one("profile", Table::Profiles, "user_id", "id")),
                ),
        )
        .await?;

    // Newest message per conversation in one query.
    let latest = store
        .query(
            &Query::table(Table::Messages)
                .filter(Filter::in_list("conversation_id", ids))
                .order_by("created_at", false)
                .order_by("id", false)
                .distinct_on("conversation_id")
                .join(Join::one("sender", Table::Profiles, "sender_id", "id"))
                .join(Join::many("message_status", Table::MessageStatus, "id", "message_id")),
        )
        .await?;
    let mut last_by_conversation: HashMap<Uuid, MessageWithDetails> = HashMap::new();
    for row in latest {
        match decode::<MessageWithDetails>(row) {
            Ok(message) => {
                last_by_conversation.insert(message.message.conversation_id, message);
            }
            Err(e) => warn!("Skipping undecodable last message: {}", e),
        }
    }

    let mut summaries = Vec::with_capacity(conversations.len());
    for row in conversations {
        match decode::<ConversationSummary>(row) {
            Ok(mut summary) => {
                summary.last_message = last_by_conversation.remove(&summary.id());
                summaries.push(summary);
            }
            Err(e) => warn!("Skipping undecodable conversation: {}", e),
        }
    }
    sort_by_activity(&mut summaries);
    Ok(summaries)
}

fn sort_by_activity(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.activity_key().cmp(&a.activity_key()));
}

/// All non-group conversations in which both users are active participants,
/// oldest first. More than one entry means the creation race happened.
pub async fn direct_conversations_between(
    store: &dyn RemoteStore,
    user_id: Uuid,
    other_user_id: Uuid,
) -> Result<Vec<Conversation>, StoreError> {
    let mine = active_conversation_ids(store, user_id).await?;
    if mine.is_empty() {
        return Ok(Vec::new());
    }

    let shared = store
        .query(
            &Query::table(Table::ConversationParticipants)
                .filter(Filter::in_list("conversation_id", mine))
                .filter(Filter::eq("user_id", other_user_id.to_string()))
                .filter(Filter::is_null("left_at")),
        )
        .await?;
    let candidates: Vec<Value> = shared.into_iter().filter_map(|mut r| r.remove("conversation_id")).collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let rows = store
        .query(
            &Query::table(Table::Conversations)
                .filter(Filter::in_list("id", candidates))
                .filter(Filter::eq("is_group", false))
                .order_by("created_at", true)
                .order_by("id", true),
        )
        .await?;
    rows.into_iter().map(decode::<Conversation>).collect()
}

/// Returns the 1:1 conversation between the two users, creating it (and both
/// participant rows) if none exists. When duplicates exist the oldest wins.
pub async fn create_or_get(store: &dyn RemoteStore, user_id: Uuid, other_user_id: Uuid) -> Result<Conversation, SyncError> {
    if user_id == other_user_id {
        return Err(SyncError::InvalidArgument("cannot start a conversation with yourself".to_string()));
    }

    let existing = direct_conversations_between(store, user_id, other_user_id).await?;
    if existing.len() > 1 {
        warn!(
            "{} direct conversations exist between {} and {}, using the oldest",
            existing.len(),
            user_id,
            other_user_id
        );
    }
    if let Some(conversation) = existing.into_iter().next() {
        debug!("Found conversation {} between {} and {}", conversation.id, user_id, other_user_id);
        return Ok(conversation);
    }

    let row = make_row([
        ("is_group", Value::Bool(false)),
        ("created_by", json!(user_id.to_string())),
    ]);
    let conversation: Conversation = decode(store.insert(Table::Conversations, row).await?)?;

    let participants = [user_id, other_user_id]
        .iter()
        .map(|member| {
            make_row([
                ("conversation_id", json!(conversation.id.to_string())),
                ("user_id", json!(member.to_string())),
            ])
        })
        .collect();
    if let Err(source) = store.insert_many(Table::ConversationParticipants, participants).await {
        let compensated = match store
            .delete(Table::Conversations, &[Filter::eq("id", conversation.id.to_string())])
            .await
        {
            Ok(_) => {
                warn!("Participant insert for {} failed, conversation removed: {}", conversation.id, source);
                true
            }
            Err(e) => {
                error!("Conversation {} is orphaned: {} (cleanup failed: {})", conversation.id, source, e);
                false
            }
        };
        return Err(SyncError::PartialWrite {
            step: "participant insert",
            compensated,
            source,
        });
    }

    info!("Created conversation {} between {} and {}", conversation.id, user_id, other_user_id);
    Ok(conversation)
}

fn matches_term(profile: Option<&Profile>, term: &str) -> bool {
    match profile {
        Some(p) => p.display_name.to_lowercase().contains(term) || p.username.to_lowercase().contains(term),
        None => false,
    }
}

/// Conversations whose other participant's name contains `term`, ignoring case.
pub fn search_conversations(summaries: &[ConversationSummary], viewer: Uuid, term: &str) -> Vec<ConversationSummary> {
    let term = term.trim().to_lowercase();
    summaries
        .iter()
        .filter(|s| {
            term.is_empty()
                || s.conversation.name.as_deref().map_or(false, |n| n.to_lowercase().contains(&term))
                || matches_term(s.other_participant(viewer).and_then(|p| p.profile.as_ref()), &term)
        })
        .cloned()
        .collect()
}

/// Profiles the viewer has no 1:1 conversation with yet, filtered by `term`.
pub fn available_profiles(
    profiles: &[Profile],
    conversations: &[ConversationSummary],
    viewer: Uuid,
    term: &str,
) -> Vec<Profile> {
    let term = term.trim().to_lowercase();
    let contacted: HashSet<Uuid> = conversations
        .iter()
        .filter(|c| !c.conversation.is_group)
        .filter_map(|c| c.other_participant(viewer))
        .map(|p| p.participant.user_id)
        .collect();
    profiles
        .iter()
        .filter(|p| p.id != viewer && !contacted.contains(&p.id))
        .filter(|p| term.is_empty() || matches_term(Some(p), &term))
        .cloned()
        .collect()
}

#[derive(Default)]
struct RegistryState {
    summaries: Vec<ConversationSummary>,
    gate: RefreshGate,
    loading: bool,
}

struct RegistryShared {
    store: SharedStore,
    ctx: SessionContext,
    state: Mutex<RegistryState>,
    notices: broadcast::Sender<SyncNotice>,
}

impl RegistryShared {
    async fn refresh(&self) -> bool {
        let ticket = {
            let mut state = self.state.lock().await;
            state.loading = true;
            state.gate.begin()
        };

        let result = fetch_conversations(&*self.store, self.ctx.user_id).await;

        let mut state = self.state.lock().await;
        state.loading = false;
        let mut fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("Error fetching conversations for {}: {}", self.ctx.user_id, e);
                return false;
            }
        };
        if !state.gate.commit(ticket) {
            debug!("Discarding conversation refresh #{}", ticket);
            return false;
        }

        // A message pushed while the fetch was in flight may be newer than what it saw.
        let mut known: HashMap<Uuid, MessageWithDetails> = state
            .summaries
            .drain(..)
            .filter_map(|s| s.last_message.map(|m| (s.conversation.id, m)))
            .collect();
        for summary in fetched.iter_mut() {
            if let Some(last) = known.remove(&summary.id()) {
                if summary.last_message.as_ref().map_or(true, |m| last.ordering_key() > m.ordering_key()) {
                    summary.last_message = Some(last);
                }
            }
        }
        sort_by_activity(&mut fetched);
        state.summaries = fetched;
        debug!("Conversation list of {} holds {} entries", self.ctx.user_id, state.summaries.len());
        drop(state);
        notify(&self.notices, SyncNotice::ConversationsChanged);
        true
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let changed = match (event.table, event.kind) {
            (Table::ConversationParticipants, _) => {
                if self.membership_concerns_viewer(&event.row).await {
                    self.refresh().await;
                }
                return;
            }
            (Table::Conversations, ChangeKind::Delete) => {
                let id = row_uuid(&event.row, "id");
                let mut state = self.state.lock().await;
                let before = state.summaries.len();
                state.summaries.retain(|s| Some(s.id()) != id);
                state.summaries.len() != before
            }
            (Table::Conversations, ChangeKind::Update) => match decode::<Conversation>(event.row) {
                Ok(conversation) => {
                    let mut state = self.state.lock().await;
                    match state.summaries.iter_mut().find(|s| s.id() == conversation.id) {
                        Some(summary) if summary.conversation.updated_at <= conversation.updated_at => {
                            summary.conversation = conversation;
                            true
                        }
                        _ => false,
                    }
                }
                Err(e) => {
                    warn!("Skipping undecodable conversation event: {}", e);
                    false
                }
            },
            (Table::Messages, ChangeKind::Insert) => self.offer_message(event.row).await,
            (Table::Messages, ChangeKind::Delete) => {
                let id = row_uuid(&event.row, "id");
                let was_last = self
                    .state
                    .lock()
                    .await
                    .summaries
                    .iter()
                    .any(|s| s.last_message.as_ref().map(|m| m.id()) == id);
                if was_last {
                    self.refresh().await;
                }
                return;
            }
            _ => false,
        };
        if changed {
            notify(&self.notices, SyncNotice::ConversationsChanged);
        }
    }

    /// The viewer joined or left, or someone else did in a listed conversation.
    async fn membership_concerns_viewer(&self, row: &Row) -> bool {
        if row_uuid(row, "user_id") == Some(self.ctx.user_id) {
            return true;
        }
        match row_uuid(row, "conversation_id") {
            Some(id) => self.state.lock().await.summaries.iter().any(|s| s.id() == id),
            None => false,
        }
    }

    async fn offer_message(&self, row: Row) -> bool {
        let conversation_id = match row_uuid(&row, "conversation_id") {
            Some(id) => id,
            None => return false,
        };
        let known = self.state.lock().await.summaries.iter().any(|s| s.id() == conversation_id);
        if !known {
            return false;
        }

        let message_id = row_uuid(&row, "id");
        let fetched = match message_id {
            Some(id) => fetch_message(&*self.store, id).await,
            None => Ok(None),
        };
        let message = match fetched {
            Ok(Some(message)) => message,
            other => {
                if let Err(e) = other {
                    warn!("Using event payload as last message of {}: {}", conversation_id, e);
                }
                match decode::<Message>(row) {
                    Ok(message) => MessageWithDetails::bare(message),
                    Err(e) => {
                        warn!("Skipping undecodable message event: {}", e);
                        return false;
                    }
                }
            }
        };

        let mut state = self.state.lock().await;
        let changed = match state.summaries.iter_mut().find(|s| s.id() == conversation_id) {
            Some(summary) => summary.offer_last_message(message),
            None => false,
        };
        if changed {
            sort_by_activity(&mut state.summaries);
        }
        changed
    }
}

/// Conversation list of one session user.
pub struct ConversationRegistry {
    shared: Arc<RegistryShared>,
    task: std::sync::Mutex<Option<SyncTask>>,
}

impl ConversationRegistry {
    pub fn new(store: SharedStore, ctx: SessionContext, notices: broadcast::Sender<SyncNotice>) -> Self {
        ConversationRegistry {
            shared: Arc::new(RegistryShared {
                store,
                ctx,
                state: Mutex::new(RegistryState::default()),
                notices,
            }),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn context(&self) -> SessionContext {
        self.shared.ctx
    }

    /// Subscribes to conversation, membership and message changes, then loads.
    pub async fn start(&self) {
        let store = self.shared.store.clone();
        let subscriptions = vec![
            store.subscribe(Table::Conversations, EventFilter::All, None),
            // Every member's rows: participant lists of listed conversations change too.
            store.subscribe(Table::ConversationParticipants, EventFilter::All, None),
            store.subscribe(Table::Messages, EventFilter::All, None),
        ];
        let shared = self.shared.clone();
        let task = SyncTask::spawn("conversations", store, subscriptions, move |event| {
            let shared = shared.clone();
            async move { shared.handle_event(event).await }
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        self.shared.refresh().await;
    }

    pub fn close(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if slot.take().is_some() {
                debug!("Conversation registry of {} closed", self.shared.ctx.user_id);
            }
        }
    }

    pub async fn refresh(&self) -> bool {
        self.shared.refresh().await
    }

    pub async fn list(&self) -> Vec<ConversationSummary> {
        self.shared.state.lock().await.summaries.clone()
    }

    pub async fn get(&self, conversation_id: Uuid) -> Option<ConversationSummary> {
        self.shared
            .state
            .lock()
            .await
            .summaries
            .iter()
            .find(|s| s.id() == conversation_id)
            .cloned()
    }

    pub async fn is_loading(&self) -> bool {
        self.shared.state.lock().await.loading
    }

    pub async fn create_or_get(&self, other_user_id: Uuid) -> Result<Conversation, SyncError> {
        let conversation = create_or_get(&*self.shared.store, self.shared.ctx.user_id, other_user_id).await?;
        if self.get(conversation.id).await.is_none() {
            self.shared.refresh().await;
        }
        Ok(conversation)
    }

    pub async fn search(&self, term: &str) -> Vec<ConversationSummary> {
        let state = self.shared.state.lock().await;
        search_conversations(&state.summaries, self.shared.ctx.user_id, term)
    }
}

impl Drop for ConversationRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, ParticipantWithProfile};
    use chrono::Utc;

    fn profile(name: &str) -> Profile {
        let now = Utc::now();
        Profile {
            id: Uuid::new_v4(),
            username: name.to_lowercase(),
            display_name: name.to_string(),
            avatar_url: None,
            status: None,
            is_online: false,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn direct(viewer: &Profile, other: &Profile) -> ConversationSummary {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let member = |p: &Profile| ParticipantWithProfile {
            participant: Participant {
                id: Uuid::new_v4(),
                conversation_id: id,
                user_id: p.id,
                joined_at: now,
                left_at: None,
                role: "member".to_string(),
            },
            profile: Some(p.clone()),
        };
        ConversationSummary {
            conversation: Conversation {
                id,
                name: None,
                is_group: false,
                created_by: viewer.id,
                created_at: now,
                updated_at: now,
            },
            participants: vec![member(viewer), member(other)],
            last_message: None,
        }
    }

    #[test]
    fn test_search_and_available_profiles() {
        let me = profile("Me");
        let alice = profile("Alice");
        let bob = profile("Bob");
        let carol = profile("Carol");
        let conversations = vec![direct(&me, &alice), direct(&me, &bob)];

        let found = search_conversations(&conversations, me.id, "ALI");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].other_participant(me.id).map(|p| p.participant.user_id), Some(alice.id));
        assert_eq!(search_conversations(&conversations, me.id, "  ").len(), 2);

        let everyone = vec![me.clone(), alice, bob, carol.clone()];
        let available = available_profiles(&everyone, &conversations, me.id, "");
        assert_eq!(available.iter().map(|p| p.id).collect::<Vec<_>>(), vec![carol.id]);
        assert!(available_profiles(&everyone, &conversations, me.id, "zed").is_empty());
    }
}
