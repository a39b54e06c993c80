//! Per-key async mutexes, created on first use.
//!
//! Used for per-user preference updates and per-cache-key recomputation.
//! There is no global lock: two different keys never contend.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Atomic get-or-create of the mutex for `key`.
    pub fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return lock.clone();
        }
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        self.lock_for(key).lock_owned().await
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    ///
    /// A lock handed out by `lock_for` keeps a second `Arc` alive until the
    /// caller is done, so `strong_count == 1` means the registry is the only
    /// owner.
    pub fn sweep_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
