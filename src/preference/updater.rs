use super::calculator::PreferenceVectorCalculator;
use super::product_vectors::ProductVectors;
use super::repository::PreferenceRepository;
use crate::error::Result;
use crate::lock_registry::KeyedLocks;
use crate::model::{now_millis, ActionType, BehaviorEvent, UserPreferenceData};
use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct UpdaterStats {
    success: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterSnapshot {
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Applies behavior events to per-user preference vectors. Updates for one
/// user are serialized through that user's lock; different users never wait
/// on each other.
pub struct PreferenceUpdater {
    calculator: PreferenceVectorCalculator,
    products: ProductVectors,
    repository: Arc<PreferenceRepository>,
    user_locks: KeyedLocks<String>,
    stats: UpdaterStats,
}

impl PreferenceUpdater {
    pub fn new(
        calculator: PreferenceVectorCalculator,
        products: ProductVectors,
        repository: Arc<PreferenceRepository>,
    ) -> Self {
        Self {
            calculator,
            products,
            repository,
            user_locks: KeyedLocks::new(),
            stats: UpdaterStats::default(),
        }
    }

    pub fn repository(&self) -> &Arc<PreferenceRepository> {
        &self.repository
    }

    pub async fn update_preference(&self, event: &BehaviorEvent) -> Result<()> {
        let Some(product_vector) = self.products.get(&event.product_id).await? else {
            debug!("No vector for product {}, skipping", event.product_id);
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        self.apply(&event.user_id, &[(product_vector.as_slice(), event.action_type)])
            .await
    }

    /// Group the batch by user (first-appearance order) and apply each user's
    /// events in batch order under a single lock acquisition. Product vectors
    /// are fetched up front, outside any lock. A failure for one user is
    /// logged and the remaining users are still processed.
    pub async fn update_preferences_batch(&self, events: &[BehaviorEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut product_ids: Vec<String> = Vec::new();
        let mut seen = ahash::AHashSet::new();
        for event in events {
            if seen.insert(event.product_id.as_str()) {
                product_ids.push(event.product_id.clone());
            }
        }
        let vectors = self.products.get_many(&product_ids).await?;

        let mut order: Vec<&str> = Vec::new();
        let mut by_user: AHashMap<&str, Vec<&BehaviorEvent>> = AHashMap::new();
        for event in events {
            by_user
                .entry(event.user_id.as_str())
                .or_insert_with(|| {
                    order.push(event.user_id.as_str());
                    Vec::new()
                })
                .push(event);
        }

        let mut updated = 0usize;
        for user_id in order {
            let user_events = &by_user[user_id];
            let updates: Vec<(&[f32], ActionType)> = user_events
                .iter()
                .filter_map(|event| {
                    vectors
                        .get(&event.product_id)
                        .map(|v| (v.as_slice(), event.action_type))
                })
                .collect();

            let missing = user_events.len() - updates.len();
            if missing > 0 {
                self.stats.skipped.fetch_add(missing as u64, Ordering::Relaxed);
            }
            if updates.is_empty() {
                debug!("No product vectors for user {}'s {} events", user_id, user_events.len());
                continue;
            }

            match self.apply(user_id, &updates).await {
                Ok(()) => updated += 1,
                Err(e) => warn!("Failed to update preference for user {}: {}", user_id, e),
            }
        }

        info!("Updated preferences for {} users from {} events", updated, events.len());
        Ok(())
    }

    async fn apply(&self, user_id: &str, updates: &[(&[f32], ActionType)]) -> Result<()> {
        let _guard = self.user_locks.acquire(&user_id.to_string()).await;

        let result = self.apply_locked(user_id, updates).await;
        match &result {
            Ok(()) => self.stats.success.fetch_add(updates.len() as u64, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(updates.len() as u64, Ordering::Relaxed),
        };
        result
    }

    async fn apply_locked(&self, user_id: &str, updates: &[(&[f32], ActionType)]) -> Result<()> {
        let current = self.repository.get(user_id).await?;
        let old_vector = current.as_ref().map(|data| data.vector.as_slice());

        let Some(vector) = self.calculator.update_batch(old_vector, updates)? else {
            return Ok(());
        };

        let action_count = current.as_ref().map_or(0, |data| data.action_count) + updates.len() as u64;
        let data = UserPreferenceData {
            vector,
            action_count,
            updated_at: now_millis(),
        };
        self.repository.put(user_id, &data).await?;

        debug!("Preference updated for user {} (actionCount={})", user_id, action_count);
        Ok(())
    }

    /// Drop lock entries for users with no update in progress.
    pub fn sweep_idle_locks(&self) -> usize {
        self.user_locks.sweep_idle()
    }

    pub fn stats(&self) -> UpdaterSnapshot {
        UpdaterSnapshot {
            success: self.stats.success.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}
