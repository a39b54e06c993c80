//! Dual-store persistence of preference vectors: fast store as primary,
//! durable document index as an asynchronously written backup.

use crate::error::{Error, Result};
use crate::lock_registry::KeyedLocks;
use crate::model::{UserPreferenceData, UserPreferenceDocument};
use crate::store::{DocumentStore, FastStore};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const KEY_PREFIX: &str = "user:preference:";

pub fn preference_key(user_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, user_id)
}

pub struct PreferenceRepository {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DocumentStore>,
    index: String,
    ttl: Duration,
    read_timeout: Duration,
    backups: Mutex<JoinSet<()>>,
    // Newest not-yet-written backup per user. Backup tasks for one user run
    // one at a time and always write whatever is newest here.
    latest_backup: Arc<DashMap<String, UserPreferenceDocument>>,
    backup_locks: Arc<KeyedLocks<String>>,
}

impl PreferenceRepository {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DocumentStore>,
        index: impl Into<String>,
        ttl: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            fast,
            durable,
            index: index.into(),
            ttl,
            read_timeout,
            backups: Mutex::new(JoinSet::new()),
            latest_backup: Arc::new(DashMap::new()),
            backup_locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Fast store first. A miss, a slow read or a fast-store error falls
    /// through to the durable copy, which is written back to the fast store
    /// unless a newer value landed there in the meantime.
    pub async fn get(&self, user_id: &str) -> Result<Option<UserPreferenceData>> {
        let key = preference_key(user_id);

        match tokio::time::timeout(self.read_timeout, self.fast.get(&key)).await {
            Ok(Ok(Some(raw))) => match serde_json::from_slice::<UserPreferenceData>(&raw) {
                Ok(data) => return Ok(Some(data)),
                Err(e) => warn!("Corrupt preference entry for user {}: {}", user_id, e),
            },
            Ok(Ok(None)) => debug!("Preference cache miss for user {}", user_id),
            Ok(Err(e)) => warn!("Fast store read failed for user {}: {}", user_id, e),
            Err(_) => warn!(
                "Fast store read timed out after {:?} for user {}, using backup",
                self.read_timeout, user_id
            ),
        }

        let Some(data) = self.get_backup(user_id).await? else {
            return Ok(None);
        };

        info!("Restored preference for user {} from backup", user_id);
        match self.refill_fast(&key, &data).await {
            Ok(true) => {}
            Ok(false) => debug!("Preference for user {} rewritten during restore, keeping newer value", user_id),
            Err(e) => warn!("Failed to refill fast store for user {}: {}", user_id, e),
        }
        Ok(Some(data))
    }

    /// Synchronous write to the fast store, then a detached backup write.
    pub async fn put(&self, user_id: &str, data: &UserPreferenceData) -> Result<()> {
        self.write_fast(&preference_key(user_id), data).await?;
        debug!("Saved preference for user {} (actionCount={})", user_id, data.action_count);
        self.put_backup_async(user_id, data);
        Ok(())
    }

    async fn write_fast(&self, key: &str, data: &UserPreferenceData) -> Result<()> {
        let raw = Bytes::from(serde_json::to_vec(data)?);
        self.fast.set(key, raw, self.ttl).await
    }

    async fn refill_fast(&self, key: &str, data: &UserPreferenceData) -> Result<bool> {
        let raw = Bytes::from(serde_json::to_vec(data)?);
        self.fast.set_if_absent(key, raw, self.ttl).await
    }

    pub async fn get_backup(&self, user_id: &str) -> Result<Option<UserPreferenceData>> {
        let Some(source) = self.durable.get(&self.index, user_id).await? else {
            return Ok(None);
        };
        let doc: UserPreferenceDocument = serde_json::from_value(source)?;
        Ok(Some(doc.into_data()))
    }

    /// Queue a durable write. Failures are logged and never reach the caller.
    ///
    /// Writes for one user never overlap, and a queued write that finds a
    /// newer document waiting writes that one instead, so the durable copy
    /// cannot move backwards.
    pub fn put_backup_async(&self, user_id: &str, data: &UserPreferenceData) {
        let durable = self.durable.clone();
        let index = self.index.clone();
        let latest = self.latest_backup.clone();
        let locks = self.backup_locks.clone();
        let user_id = user_id.to_string();
        latest.insert(user_id.clone(), UserPreferenceDocument::new(&user_id, data));

        let mut backups = self.backups.lock();
        // Reap finished tasks so the set stays bounded by in-flight writes.
        while backups.try_join_next().is_some() {}
        backups.spawn(async move {
            let _guard = locks.acquire(&user_id).await;
            let Some((_, doc)) = latest.remove(&user_id) else {
                debug!("Newer backup for user {} already written", user_id);
                return;
            };
            let result = match serde_json::to_value(&doc) {
                Ok(value) => durable.index(&index, &user_id, value).await,
                Err(e) => Err(Error::from(e)),
            };
            match result {
                Ok(()) => debug!("Backed up preference for user {}", user_id),
                Err(e) => warn!("Preference backup failed for user {}: {}", user_id, e),
            }
        });
    }

    pub fn pending_backups(&self) -> usize {
        self.backups.lock().len()
    }

    pub fn sweep_idle_locks(&self) -> usize {
        self.backup_locks.sweep_idle()
    }

    /// Wait for queued backups up to `timeout`; whatever is still running
    /// afterwards is aborted. Returns how many backups were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let mut backups = std::mem::take(&mut *self.backups.lock());
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = backups.join_next().await {
                if let Err(e) = result {
                    error!("Preference backup task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_ok() {
            info!("Preference backups flushed");
            return 0;
        }

        let abandoned = backups.len();
        warn!("Abandoning {} preference backups after {:?}", abandoned, timeout);
        backups.abort_all();
        abandoned
    }
}
