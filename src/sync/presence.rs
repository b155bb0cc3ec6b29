// Presence heartbeat
// Online/offline transitions tied to the session lifecycle, written through
// the profile directory.

use log::{debug, info, warn};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ProfileDirectory;
use crate::error::SyncError;
use crate::identity::SessionSignal;
use crate::models::Profile;

struct Beat {
    user_id: Uuid,
    ticker: Option<JoinHandle<()>>,
}

pub struct PresenceHeartbeat {
    directory: Arc<ProfileDirectory>,
    interval: Option<Duration>,
    current: Mutex<Option<Beat>>,
}

impl PresenceHeartbeat {
    pub fn new(directory: Arc<ProfileDirectory>, interval: Option<Duration>) -> Self {
        PresenceHeartbeat {
            directory,
            interval,
            current: Mutex::new(None),
        }
    }

    pub fn online_user(&self) -> Option<Uuid> {
        self.current.lock().ok().and_then(|c| c.as_ref().map(|b| b.user_id))
    }

    pub async fn session_started(&self, user_id: Uuid) -> Result<Profile, SyncError> {
        self.stop_ticker();
        let profile = self.directory.update_online_status(user_id, true).await?;
        let ticker = self.interval.map(|interval| self.spawn_ticker(user_id, interval));
        if let Ok(mut current) = self.current.lock() {
            *current = Some(Beat { user_id, ticker });
        }
        Ok(profile)
    }

    pub async fn session_ended(&self, user_id: Uuid) -> Result<Profile, SyncError> {
        let beat = self.current.lock().ok().and_then(|mut c| c.take());
        if let Some(beat) = beat {
            if let Some(ticker) = beat.ticker {
                ticker.abort();
            }
            if beat.user_id != user_id {
                warn!("Session end for {} while {} was online", user_id, beat.user_id);
            }
        }
        self.directory.update_online_status(user_id, false).await
    }

    pub async fn handle_signal(&self, signal: SessionSignal) -> Result<Profile, SyncError> {
        match signal {
            SessionSignal::Started(user_id) => self.session_started(user_id).await,
            SessionSignal::Ended(user_id) => self.session_ended(user_id).await,
        }
    }

    fn stop_ticker(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(ticker) = current.as_mut().and_then(|b| b.ticker.take()) {
                ticker.abort();
            }
        }
    }

    fn spawn_ticker(&self, user_id: Uuid, interval: Duration) -> JoinHandle<()> {
        let directory = self.directory.clone();
        tokio::spawn(async move {
            loop {
                // Spread heartbeats of many clients by up to a tenth of the interval.
                let jitter_ms = {
                    let spread = (interval.as_millis() / 10) as u64;
                    rand::thread_rng().gen_range(0..=spread)
                };
                tokio::time::sleep(interval + Duration::from_millis(jitter_ms)).await;
                match directory.update_online_status(user_id, true).await {
                    Ok(_) => debug!("Heartbeat for {}", user_id),
                    Err(e) => warn!("Heartbeat for {} failed: {}", user_id, e),
                }
            }
        })
    }
}

impl Drop for PresenceHeartbeat {
    /// Best effort: if a runtime is still around, queue the offline write.
    fn drop(&mut self) {
        let beat = self.current.get_mut().ok().and_then(|c| c.take());
        let beat = match beat {
            Some(beat) => beat,
            None => return,
        };
        if let Some(ticker) = beat.ticker {
            ticker.abort();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let directory = self.directory.clone();
                handle.spawn(async move {
                    if let Err(e) = directory.update_online_status(beat.user_id, false).await {
                        warn!("Offline write for {} on teardown failed: {}", beat.user_id, e);
                    }
                });
                info!("Queued offline write for {}", beat.user_id);
            }
            Err(_) => warn!("No runtime left to mark {} offline", beat.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{make_row, MemoryStore, RemoteStore, Table};
    use serde_json::json;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_heartbeat_restamps_last_seen_while_online() {
        let store = Arc::new(MemoryStore::new());
        let row = store
            .insert(Table::Profiles, make_row([("username", json!("ann")), ("full_name", json!("Ann"))]))
            .await
            .unwrap();
        let id = Uuid::parse_str(row["id"].as_str().unwrap()).unwrap();
        let (tx, _) = broadcast::channel(16);
        let directory = Arc::new(ProfileDirectory::new(store.clone(), tx));

        let heartbeat = PresenceHeartbeat::new(directory.clone(), Some(Duration::from_millis(20)));
        let first = heartbeat.session_started(id).await.unwrap();
        assert_eq!(heartbeat.online_user(), Some(id));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let later = directory.get(id).await.unwrap();
        assert!(later.last_seen > first.last_seen);

        let offline = heartbeat.session_ended(id).await.unwrap();
        assert!(!offline.is_online);
        assert_eq!(heartbeat.online_user(), None);
    }
}
