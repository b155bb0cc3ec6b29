// Identity provider seam
// Supplies the authenticated user id and session start/end signals.

use log::{info, warn};
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Started(Uuid),
    Ended(Uuid),
}

/// Explicit "who is looking" context handed to every per-user component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub user_id: Uuid,
}

impl SessionContext {
    pub fn new(user_id: Uuid) -> Self {
        SessionContext { user_id }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<Uuid>;

    fn signals(&self) -> broadcast::Receiver<SessionSignal>;
}

/// Identity driven by the embedding application, e.g. from config or a login prompt.
pub struct LocalIdentity {
    current: RwLock<Option<Uuid>>,
    tx: broadcast::Sender<SessionSignal>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        LocalIdentity {
            current: RwLock::new(None),
            tx,
        }
    }

    pub fn signed_in(user_id: Uuid) -> Self {
        let identity = Self::new();
        if let Ok(mut current) = identity.current.write() {
            *current = Some(user_id);
        }
        identity
    }

    /// Switches to `user_id`, ending any previous session first.
    pub fn sign_in(&self, user_id: Uuid) {
        let previous = match self.current.write() {
            Ok(mut current) => current.replace(user_id),
            Err(_) => {
                warn!("Identity lock poisoned, ignoring sign-in of {}", user_id);
                return;
            }
        };
        if previous == Some(user_id) {
            return;
        }
        if let Some(previous) = previous {
            self.emit(SessionSignal::Ended(previous));
        }
        info!("Signed in as {}", user_id);
        self.emit(SessionSignal::Started(user_id));
    }

    pub fn sign_out(&self) {
        let previous = match self.current.write() {
            Ok(mut current) => current.take(),
            Err(_) => {
                warn!("Identity lock poisoned, ignoring sign-out");
                return;
            }
        };
        if let Some(previous) = previous {
            info!("Signed out {}", previous);
            self.emit(SessionSignal::Ended(previous));
        }
    }

    fn emit(&self, signal: SessionSignal) {
        // No receivers yet is fine; a listener picks up `current_user` when it attaches.
        let _ = self.tx.send(signal);
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for LocalIdentity {
    fn current_user(&self) -> Option<Uuid> {
        self.current.read().ok().and_then(|c| *c)
    }

    fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switching_users_ends_the_previous_session() {
        let identity = LocalIdentity::new();
        let mut rx = identity.signals();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        identity.sign_in(a);
        identity.sign_in(a);
        identity.sign_in(b);
        identity.sign_out();
        identity.sign_out();

        let signals: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            signals,
            vec![
                SessionSignal::Started(a),
                SessionSignal::Ended(a),
                SessionSignal::Started(b),
                SessionSignal::Ended(b),
            ]
        );
        assert_eq!(identity.current_user(), None);
    }
}
