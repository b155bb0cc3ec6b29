// Synchronization layer
// Caching components kept consistent with the remote store via pull queries
// and push subscriptions, plus the client that ties them to a session.

use futures_util::StreamExt;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SyncError;
use crate::identity::{IdentityProvider, SessionContext, SessionSignal};
use crate::models::{Conversation, ConversationSummary, MessageWithDetails, Profile, ProfileUpdate};
use crate::store::{ChangeEvent, SharedStore, Subscription, SubscriptionId};

pub mod conversations;
pub mod messages;
pub mod presence;
pub mod profiles;
pub mod receipts;

pub use conversations::ConversationRegistry;
pub use messages::{MessageStream, NewMessage};
pub use presence::PresenceHeartbeat;
pub use profiles::ProfileDirectory;
pub use receipts::{StatusOutcome, StatusPolicy};

/// Coarse change notifications for the outer (rendering) layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    ProfilesChanged,
    ConversationsChanged,
    MessagesChanged { conversation_id: Uuid },
}

pub(crate) fn notify(tx: &broadcast::Sender<SyncNotice>, notice: SyncNotice) {
    // Nobody listening is not an error.
    let _ = tx.send(notice);
}

/// Orders full refreshes: each one takes a ticket when it starts and may
/// only be applied if no later-started refresh has been applied already.
#[derive(Debug, Default)]
pub(crate) struct RefreshGate {
    issued: u64,
    applied: u64,
}

impl RefreshGate {
    pub(crate) fn begin(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    pub(crate) fn commit(&mut self, ticket: u64) -> bool {
        if ticket <= self.applied {
            return false;
        }
        self.applied = ticket;
        true
    }
}

/// Drains a set of subscriptions through one sequential handler. Dropping
/// the task releases every subscription it owns.
pub struct SyncTask {
    label: &'static str,
    store: SharedStore,
    subscriptions: Vec<SubscriptionId>,
    handle: JoinHandle<()>,
}

impl SyncTask {
    pub fn spawn<F, Fut>(label: &'static str, store: SharedStore, subscriptions: Vec<Subscription>, mut handler: F) -> Self
    where
        F: FnMut(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ids: Vec<SubscriptionId> = subscriptions.iter().map(|s| s.id).collect();
        let mut merged = futures_util::stream::select_all(subscriptions.into_iter().map(Subscription::into_stream));
        let handle = tokio::spawn(async move {
            while let Some(event) = merged.next().await {
                debug!("[{}] {:?} on {}", label, event.kind, event.table);
                handler(event).await;
            }
            debug!("[{}] event stream ended", label);
        });
        debug!("[{}] listening on {} subscription(s)", label, ids.len());
        SyncTask { label, store, subscriptions: ids, handle }
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        for id in &self.subscriptions {
            self.store.unsubscribe(*id);
        }
        self.handle.abort();
        debug!("[{}] released {} subscription(s)", self.label, self.subscriptions.len());
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub status_policy: StatusPolicy,
    /// Re-stamp `last_seen` this often while online.
    pub heartbeat_interval: Option<Duration>,
}

struct ActiveSession {
    ctx: SessionContext,
    profiles: Arc<ProfileDirectory>,
    conversations: ConversationRegistry,
    presence: PresenceHeartbeat,
    active: Option<MessageStream>,
}

/// Owns the per-session components and the active conversation selection.
pub struct ChatClient {
    store: SharedStore,
    options: SyncOptions,
    notices: broadcast::Sender<SyncNotice>,
    session: Mutex<Option<ActiveSession>>,
}

impl ChatClient {
    pub fn new(store: SharedStore, options: SyncOptions) -> Self {
        let (notices, _) = broadcast::channel(256);
        ChatClient {
            store,
            options,
            notices,
            session: Mutex::new(None),
        }
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Loads the per-user components for `user_id`. An existing session for
    /// another user is ended first.
    pub async fn begin_session(&self, user_id: Uuid) -> SessionContext {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if existing.ctx.user_id == user_id {
                return existing.ctx;
            }
        }
        if let Some(previous) = session.take() {
            Self::teardown(previous).await;
        }

        let ctx = SessionContext::new(user_id);
        info!("Starting session for {}", user_id);

        let profiles = Arc::new(ProfileDirectory::new(self.store.clone(), self.notices.clone()));
        profiles.start().await;

        let conversations = ConversationRegistry::new(self.store.clone(), ctx, self.notices.clone());
        conversations.start().await;

        let presence = PresenceHeartbeat::new(profiles.clone(), self.options.heartbeat_interval);
        if let Err(e) = presence.session_started(user_id).await {
            warn!("Could not mark {} online: {}", user_id, e);
        }

        *session = Some(ActiveSession {
            ctx,
            profiles,
            conversations,
            presence,
            active: None,
        });
        ctx
    }

    pub async fn end_session(&self) {
        let previous = self.session.lock().await.take();
        match previous {
            Some(previous) => Self::teardown(previous).await,
            None => debug!("end_session called without an active session"),
        }
    }

    async fn teardown(session: ActiveSession) {
        let user_id = session.ctx.user_id;
        drop(session.active);
        if let Err(e) = session.presence.session_ended(user_id).await {
            warn!("Could not mark {} offline: {}", user_id, e);
        }
        session.conversations.close();
        session.profiles.close();
        info!("Session for {} ended", user_id);
    }

    pub async fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Started(user_id) => {
                self.begin_session(user_id).await;
            }
            SessionSignal::Ended(user_id) => {
                if self.context().await.map(|c| c.user_id) == Some(user_id) {
                    self.end_session().await;
                } else {
                    debug!("Ignoring end signal for inactive user {}", user_id);
                }
            }
        }
    }

    /// Drives the session from `identity` until its signal channel closes.
    pub fn follow(self: Arc<Self>, identity: Arc<dyn IdentityProvider>) -> JoinHandle<()> {
        let mut signals = identity.signals();
        tokio::spawn(async move {
            if let Some(user_id) = identity.current_user() {
                self.begin_session(user_id).await;
            }
            loop {
                match signals.recv().await {
                    Ok(signal) => self.handle_signal(signal).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} session signals, resyncing with identity provider", missed);
                        match identity.current_user() {
                            Some(user_id) => {
                                self.begin_session(user_id).await;
                            }
                            None => self.end_session().await,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Identity signal channel closed");
        })
    }

    pub async fn context(&self) -> Option<SessionContext> {
        self.session.lock().await.as_ref().map(|s| s.ctx)
    }

    pub async fn profiles(&self) -> Result<Vec<Profile>, SyncError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(SyncError::NoSession)?;
        Ok(session.profiles.list().await)
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Profile, SyncError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(SyncError::NoSession)?;
        session.profiles.update_profile(session.ctx.user_id, update).await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(SyncError::NoSession)?;
        Ok(session.conversations.list().await)
    }

    pub async fn start_conversation(&self, other_user_id: Uuid) -> Result<Conversation, SyncError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(SyncError::NoSession)?;
        session.conversations.create_or_get(other_user_id).await
    }

    /// Switches the active conversation. The previous message stream and its
    /// subscription are released; `None` just clears the selection.
    pub async fn select_conversation(&self, conversation_id: Option<Uuid>) -> Result<(), SyncError> {
        let mut session = self.session.lock().await;
        let session = session.as_mut().ok_or(SyncError::NoSession)?;

        if session.active.as_ref().map(|s| s.conversation_id()) == conversation_id && conversation_id.is_some() {
            return Ok(());
        }
        session.active = None;

        let conversation_id = match conversation_id {
            Some(id) => id,
            None => return Ok(()),
        };

        if session.conversations.get(conversation_id).await.is_none() {
            session.conversations.refresh().await;
        }
        let member = session
            .conversations
            .get(conversation_id)
            .await
            .map_or(false, |c| c.has_participant(session.ctx.user_id));
        if !member {
            return Err(SyncError::NotParticipant {
                conversation_id,
                user_id: session.ctx.user_id,
            });
        }

        let stream = MessageStream::open(
            self.store.clone(),
            session.ctx,
            conversation_id,
            self.options.status_policy,
            self.notices.clone(),
        )
        .await;
        session.active = Some(stream);
        notify(&self.notices, SyncNotice::MessagesChanged { conversation_id });
        Ok(())
    }

    pub async fn active_conversation(&self) -> Option<Uuid> {
        let session = self.session.lock().await;
        session.as_ref().and_then(|s| s.active.as_ref()).map(|a| a.conversation_id())
    }

    pub async fn messages(&self) -> Result<Vec<MessageWithDetails>, SyncError> {
        let session = self.session.lock().await;
        let stream = Self::active_stream(session.as_ref())?;
        Ok(stream.list().await)
    }

    pub async fn send(&self, content: &str) -> Result<MessageWithDetails, SyncError> {
        self.send_new(NewMessage::text(content)).await
    }

    pub async fn send_new(&self, message: NewMessage) -> Result<MessageWithDetails, SyncError> {
        let session = self.session.lock().await;
        let stream = Self::active_stream(session.as_ref())?;
        stream.send_new(message).await
    }

    pub async fn mark_read(&self, message_id: Uuid) -> Result<StatusOutcome, SyncError> {
        let session = self.session.lock().await;
        let stream = Self::active_stream(session.as_ref())?;
        stream.mark_read(message_id).await
    }

    pub async fn mark_all_read(&self) -> Result<usize, SyncError> {
        let session = self.session.lock().await;
        let stream = Self::active_stream(session.as_ref())?;
        stream.mark_all_read().await
    }

    /// True while any component of the session is running a full refresh.
    pub async fn is_loading(&self) -> bool {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(s) => {
                let active = match &s.active {
                    Some(stream) => stream.is_loading().await,
                    None => false,
                };
                active || s.profiles.is_loading().await || s.conversations.is_loading().await
            }
            None => false,
        }
    }

    fn active_stream(session: Option<&ActiveSession>) -> Result<&MessageStream, SyncError> {
        let session = session.ok_or(SyncError::NoSession)?;
        session.active.as_ref().ok_or(SyncError::NoConversation)
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Ok(session) = self.session.try_lock() {
            if session.is_some() {
                warn!("ChatClient dropped with an active session; call end_session first");
            }
        }
    }
}
