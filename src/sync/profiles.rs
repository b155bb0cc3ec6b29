// Profile directory
// Keeps every known profile and its presence flags, patched from push events.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::{notify, RefreshGate, SyncNotice, SyncTask};
use crate::error::{StoreError, SyncError};
use crate::models::{ts, Profile, ProfileUpdate};
use crate::store::{decode, make_row, ChangeEvent, ChangeKind, EventFilter, Filter, Query, Row, SharedStore, Table};

#[derive(Default)]
struct ProfileCache {
    by_id: HashMap<Uuid, Profile>,
    gate: RefreshGate,
    loading: bool,
}

impl ProfileCache {
    /// Keeps whichever copy carries the later `updated_at`.
    fn upsert(&mut self, profile: Profile) -> bool {
        if let Some(current) = self.by_id.get(&profile.id) {
            if current.updated_at > profile.updated_at {
                debug!("Ignoring stale copy of profile {}", profile.id);
                return false;
            }
        }
        self.by_id.insert(profile.id, profile);
        true
    }

    fn apply_event(&mut self, event: ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::Delete => {
                let id = event.row.get("id").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok());
                match id {
                    Some(id) => self.by_id.remove(&id).is_some(),
                    None => false,
                }
            }
            ChangeKind::Insert | ChangeKind::Update => match decode::<Profile>(event.row) {
                Ok(profile) => self.upsert(profile),
                Err(e) => {
                    warn!("Skipping undecodable profile event: {}", e);
                    false
                }
            },
        }
    }
}

pub struct ProfileDirectory {
    store: SharedStore,
    cache: Arc<Mutex<ProfileCache>>,
    notices: broadcast::Sender<SyncNotice>,
    task: std::sync::Mutex<Option<SyncTask>>,
}

impl ProfileDirectory {
    pub fn new(store: SharedStore, notices: broadcast::Sender<SyncNotice>) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(ProfileCache::default())),
            notices,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Opens the profile subscription, then loads the initial state. Calling
    /// it again replaces the previous subscription.
    pub async fn start(&self) {
        let subscription = self.store.subscribe(Table::Profiles, EventFilter::All, None);
        let cache = self.cache.clone();
        let notices = self.notices.clone();
        let task = SyncTask::spawn("profiles", self.store.clone(), vec![subscription], move |event| {
            let cache = cache.clone();
            let notices = notices.clone();
            async move {
                let changed = cache.lock().await.apply_event(event);
                if changed {
                    notify(&notices, SyncNotice::ProfilesChanged);
                }
            }
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        self.refresh().await;
    }

    /// Releases the subscription. The cache keeps its last contents.
    pub fn close(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if slot.take().is_some() {
                debug!("Profile directory subscription closed");
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Full re-query of the profile table. Failures are logged and leave the
    /// cache as it was. Returns whether the result was applied.
    pub async fn refresh(&self) -> bool {
        let ticket = {
            let mut cache = self.cache.lock().await;
            cache.loading = true;
            cache.gate.begin()
        };

        let result = fetch_profiles(&*self.store).await;

        let mut cache = self.cache.lock().await;
        cache.loading = false;
        let profiles = match result {
            Ok(profiles) => profiles,
            Err(e) => {
                error!("Error fetching profiles: {}", e);
                return false;
            }
        };
        if !cache.gate.commit(ticket) {
            debug!("Discarding profile refresh #{}, a newer one was applied", ticket);
            return false;
        }

        let previous = std::mem::take(&mut cache.by_id);
        for profile in profiles {
            cache.by_id.insert(profile.id, profile);
        }
        for (id, profile) in previous {
            if cache.by_id.get(&id).map_or(false, |fetched| fetched.updated_at < profile.updated_at) {
                cache.by_id.insert(id, profile);
            }
        }
        debug!("Profile cache refreshed with {} entries", cache.by_id.len());
        drop(cache);
        notify(&self.notices, SyncNotice::ProfilesChanged);
        true
    }

    /// Every cached profile, ordered by display name then id.
    pub async fn list(&self) -> Vec<Profile> {
        let cache = self.cache.lock().await;
        let mut profiles: Vec<Profile> = cache.by_id.values().cloned().collect();
        profiles.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        profiles
    }

    pub async fn get(&self, id: Uuid) -> Option<Profile> {
        self.cache.lock().await.by_id.get(&id).cloned()
    }

    pub async fn is_loading(&self) -> bool {
        self.cache.lock().await.loading
    }

    /// Sets the online flag and stamps `last_seen` with the current time.
    pub async fn update_online_status(&self, user_id: Uuid, is_online: bool) -> Result<Profile, SyncError> {
        let patch = make_row([
            ("is_online", Value::Bool(is_online)),
            ("last_seen", json!(ts::format(&Utc::now()))),
        ]);
        let profile = self.write(user_id, patch).await?;
        info!("Presence of {} set to {}", user_id, if is_online { "online" } else { "offline" });
        Ok(profile)
    }

    pub async fn update_profile(&self, user_id: Uuid, update: ProfileUpdate) -> Result<Profile, SyncError> {
        if update.is_empty() {
            return Err(SyncError::InvalidArgument("profile update has no fields".to_string()));
        }
        if matches!(update.username.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(SyncError::InvalidArgument("username cannot be empty".to_string()));
        }
        let patch = match serde_json::to_value(&update).map_err(StoreError::from)? {
            Value::Object(patch) => patch,
            _ => return Err(SyncError::InvalidArgument("profile update is not an object".to_string())),
        };
        self.write(user_id, patch).await
    }

    /// Writes through to the store and patches the cache with the stored row.
    async fn write(&self, user_id: Uuid, patch: Row) -> Result<Profile, SyncError> {
        let rows = self
            .store
            .update(Table::Profiles, &[Filter::eq("id", user_id.to_string())], patch)
            .await?;
        let row = rows.into_iter().next().ok_or(StoreError::NotFound { table: Table::Profiles })?;
        let profile: Profile = decode(row)?;
        let changed = self.cache.lock().await.upsert(profile.clone());
        if changed {
            notify(&self.notices, SyncNotice::ProfilesChanged);
        }
        Ok(profile)
    }
}

impl Drop for ProfileDirectory {
    fn drop(&mut self) {
        self.close();
    }
}

/// One-shot query of all profiles, ordered by display name.
pub async fn fetch_profiles(store: &dyn crate::store::RemoteStore) -> Result<Vec<Profile>, StoreError> {
    let rows = store
        .query(&Query::table(Table::Profiles).order_by("full_name", true).order_by("id", true))
        .await?;
    let mut profiles = Vec::with_capacity(rows.len());
    for row in rows {
        match decode::<Profile>(row) {
            Ok(profile) => profiles.push(profile),
            Err(e) => warn!("Skipping undecodable profile row: {}", e),
        }
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RemoteStore};

    async fn seeded() -> (Arc<MemoryStore>, ProfileDirectory, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let row = store
            .insert(Table::Profiles, make_row([("username", json!("zed")), ("full_name", json!("Zed"))]))
            .await
            .unwrap();
        let id = Uuid::parse_str(row["id"].as_str().unwrap()).unwrap();
        let (tx, _) = broadcast::channel(16);
        let directory = ProfileDirectory::new(store.clone(), tx);
        (store, directory, id)
    }

    #[tokio::test]
    async fn test_stale_event_does_not_overwrite_newer_profile() {
        let (_store, directory, id) = seeded().await;
        directory.refresh().await;
        let fresh = directory.update_online_status(id, true).await.unwrap();

        let mut stale = fresh.clone();
        stale.is_online = false;
        stale.updated_at = fresh.updated_at - chrono::Duration::seconds(5);
        let row = match serde_json::to_value(&stale).unwrap() {
            Value::Object(row) => row,
            _ => unreachable!(),
        };
        let changed = directory.cache.lock().await.apply_event(ChangeEvent {
            table: Table::Profiles,
            kind: ChangeKind::Update,
            row,
        });

        assert!(!changed);
        assert!(directory.get(id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_out_of_order_refresh_is_discarded() {
        let (_store, directory, _id) = seeded().await;
        let (older, newer) = {
            let mut cache = directory.cache.lock().await;
            (cache.gate.begin(), cache.gate.begin())
        };
        let mut cache = directory.cache.lock().await;
        assert!(cache.gate.commit(newer));
        assert!(!cache.gate.commit(older));
    }

    #[tokio::test]
    async fn test_update_profile_rejects_empty_patch() {
        let (_store, directory, id) = seeded().await;
        let err = directory.update_profile(id, ProfileUpdate::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_user_is_not_found() {
        let (_store, directory, _id) = seeded().await;
        let err = directory.update_online_status(Uuid::new_v4(), true).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::NotFound { .. })));
    }
}
