use super::FastStore;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedData {
    data: Bytes,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

/// Key-value store with per-entry TTL. Expired entries are dropped lazily on
/// read and in bulk by `purge_expired`.
pub struct InMemoryFastStore {
    entries: DashMap<String, CachedData>,
    stats: CacheStats,
}

impl InMemoryFastStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity(10_000),
            stats: CacheStats::default(),
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        self.stats.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> FastStoreStats {
        FastStoreStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for InMemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let found = self.entries.get(key).map(|entry| entry.clone());

        match found {
            Some(entry) if entry.expires_at > now => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.data))
            }
            Some(_) => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CachedData {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = CachedData {
            data: value,
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(false);
                }
                entry.insert(fresh);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = InMemoryFastStore::new();
        store.set("k", Bytes::from_static(b"v"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn expired_entries_read_as_miss() {
        let store = InMemoryFastStore::new();
        store.set("k", Bytes::from_static(b"v"), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let store = InMemoryFastStore::new();
        store.set("short", Bytes::from_static(b"1"), Duration::from_millis(5)).await.unwrap();
        store.set("long", Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.delete("long").await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_keeps_live_entry_and_replaces_expired() {
        let store = InMemoryFastStore::new();
        store.set("k", Bytes::from_static(b"new"), Duration::from_secs(60)).await.unwrap();
        assert!(!store.set_if_absent("k", Bytes::from_static(b"old"), Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"new")));

        store.set("e", Bytes::from_static(b"1"), Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.set_if_absent("e", Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("e").await.unwrap(), Some(Bytes::from_static(b"2")));

        assert!(store.set_if_absent("fresh", Bytes::from_static(b"3"), Duration::from_secs(60)).await.unwrap());
    }
}
