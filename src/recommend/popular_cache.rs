//! Popularity lists for cold-start traffic, cached in the fast store with a
//! per-key lock so each expired key is recomputed by exactly one caller.

use crate::config::{CacheConfig, IndexNames};
use crate::error::Result;
use crate::lock_registry::KeyedLocks;
use crate::model::{now_millis, ActionType, ProductDocument, ProductRecommendation, Strategy};
use crate::store::{DocumentStore, FastStore, Filter, SearchQuery, SortOrder, TermsAggregation};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GLOBAL_KEY: &str = "popular:global";
const CATEGORY_KEY_PREFIX: &str = "popular:category:";
const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

pub fn cache_key(category: Option<&str>) -> String {
    match category {
        Some(category) => format!("{}{}", CATEGORY_KEY_PREFIX, category),
        None => GLOBAL_KEY.to_string(),
    }
}

/// One step of the cold-start chain. Tried in `CHAIN` order; the first tier
/// with results wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Purchases,
    Engagement,
    Newest,
}

const CHAIN: [Tier; 3] = [Tier::Purchases, Tier::Engagement, Tier::Newest];

impl Tier {
    fn strategy(self, category: Option<&str>) -> Strategy {
        match (self, category.is_some()) {
            (Tier::Purchases, false) => Strategy::PopularityGlobal,
            (Tier::Purchases, true) => Strategy::PopularityCategory,
            (Tier::Engagement, false) => Strategy::TrendingGlobal,
            (Tier::Engagement, true) => Strategy::TrendingCategory,
            (Tier::Newest, _) => Strategy::NewestFallback,
        }
    }

    fn actions(self) -> &'static [ActionType] {
        match self {
            Tier::Purchases => &[ActionType::Purchase],
            Tier::Engagement => &[ActionType::View, ActionType::Click],
            Tier::Newest => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPopular {
    strategy: Strategy,
    products: Vec<ProductRecommendation>,
}

pub struct PopularProductsCache {
    fast: Arc<dyn FastStore>,
    documents: Arc<dyn DocumentStore>,
    indices: IndexNames,
    config: CacheConfig,
    window_days: i64,
    key_locks: KeyedLocks<String>,
    recomputations: AtomicU64,
}

impl PopularProductsCache {
    pub fn new(
        fast: Arc<dyn FastStore>,
        documents: Arc<dyn DocumentStore>,
        indices: IndexNames,
        config: CacheConfig,
        window_days: i64,
    ) -> Self {
        Self {
            fast,
            documents,
            indices,
            config,
            window_days,
            key_locks: KeyedLocks::new(),
            recomputations: AtomicU64::new(0),
        }
    }

    /// Top products overall, or within `category`, with the tier that
    /// produced them.
    pub async fn top_products(
        &self,
        limit: usize,
        category: Option<&str>,
    ) -> Result<(Vec<ProductRecommendation>, Strategy)> {
        let key = cache_key(category);

        if let Some(hit) = self.read_cached(&key).await {
            debug!("Popular cache hit: {}", key);
            return Ok(Self::take(hit, limit));
        }

        let _guard = self.key_locks.acquire(&key).await;

        // Another caller may have filled the key while we waited.
        if let Some(hit) = self.read_cached(&key).await {
            debug!("Popular cache filled while waiting: {}", key);
            return Ok(Self::take(hit, limit));
        }

        let size = match category {
            Some(_) => self.config.category_cache_size,
            None => self.config.global_cache_size,
        };
        let computed = self.compute(category, size).await?;
        self.recomputations.fetch_add(1, Ordering::Relaxed);

        if computed.products.is_empty() {
            info!("No popular products for {}, not caching", key);
        } else {
            self.write_cached(&key, &computed).await;
        }

        Ok(Self::take(computed, limit))
    }

    fn take(mut entry: CachedPopular, limit: usize) -> (Vec<ProductRecommendation>, Strategy) {
        entry.products.truncate(limit);
        (entry.products, entry.strategy)
    }

    async fn read_cached(&self, key: &str) -> Option<CachedPopular> {
        let raw = match self.fast.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Popular cache read failed for {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Discarding unreadable popular cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn write_cached(&self, key: &str, entry: &CachedPopular) {
        let raw = match serde_json::to_vec(entry) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                warn!("Failed to encode popular cache entry {}: {}", key, e);
                return;
            }
        };
        match self.fast.set(key, raw, self.config.popular_ttl()).await {
            Ok(()) => info!(
                "Cached {} popular products under {} ({})",
                entry.products.len(),
                key,
                entry.strategy
            ),
            Err(e) => warn!("Popular cache write failed for {}: {}", key, e),
        }
    }

    async fn compute(&self, category: Option<&str>, size: usize) -> Result<CachedPopular> {
        for tier in CHAIN {
            let products = match tier {
                Tier::Newest => self.newest(category, size).await?,
                _ => self.most_active(tier.actions(), category, size).await?,
            };
            if !products.is_empty() {
                return Ok(CachedPopular {
                    strategy: tier.strategy(category),
                    products,
                });
            }
            debug!("{:?} tier empty for {:?}", tier, category);
        }

        Ok(CachedPopular {
            strategy: Tier::Newest.strategy(category),
            products: Vec::new(),
        })
    }

    async fn most_active(
        &self,
        actions: &[ActionType],
        category: Option<&str>,
        size: usize,
    ) -> Result<Vec<ProductRecommendation>> {
        let since = now_millis() - self.window_days * DAY_MILLIS;
        let mut filters = vec![
            Filter::terms("actionType", actions.iter().map(|a| a.as_str())),
            Filter::AtLeast {
                field: "timestamp".to_string(),
                value: since as f64,
            },
        ];
        if let Some(category) = category {
            filters.push(Filter::term("category", category));
        }

        let buckets = self
            .documents
            .terms_aggregation(
                &self.indices.behavior,
                TermsAggregation {
                    field: "productId".to_string(),
                    filters,
                    size,
                },
            )
            .await?;
        if buckets.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = buckets.into_iter().map(|b| b.key).collect();
        self.product_details(&ids).await
    }

    /// Products in bucket order; ids with no catalog entry are dropped.
    async fn product_details(&self, ids: &[String]) -> Result<Vec<ProductRecommendation>> {
        let docs = self.documents.mget(&self.indices.product, ids).await?;
        Ok(docs
            .into_iter()
            .filter_map(|(id, source)| match serde_json::from_value::<ProductDocument>(source) {
                Ok(doc) => Some(ProductRecommendation::from_document(&id, doc, 0.0)),
                Err(e) => {
                    warn!("Skipping unreadable product {}: {}", id, e);
                    None
                }
            })
            .collect())
    }

    async fn newest(&self, category: Option<&str>, size: usize) -> Result<Vec<ProductRecommendation>> {
        let filters = category
            .map(|category| vec![Filter::term("category", category)])
            .unwrap_or_default();
        let hits = self
            .documents
            .search(
                &self.indices.product,
                SearchQuery {
                    filters,
                    sort: Some(("createdAt".to_string(), SortOrder::Desc)),
                    size,
                },
            )
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                serde_json::from_value::<ProductDocument>(hit.source)
                    .ok()
                    .map(|doc| ProductRecommendation::from_document(&hit.id, doc, 0.0))
            })
            .collect())
    }

    pub async fn invalidate(&self, category: Option<&str>) -> Result<bool> {
        self.fast.delete(&cache_key(category)).await
    }

    /// How many times a list was computed rather than served from cache.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    pub fn sweep_idle_locks(&self) -> usize {
        self.key_locks.sweep_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_cache_layout() {
        assert_eq!(cache_key(None), "popular:global");
        assert_eq!(cache_key(Some("shoes")), "popular:category:shoes");
    }

    #[test]
    fn chain_order_and_tags() {
        assert_eq!(CHAIN, [Tier::Purchases, Tier::Engagement, Tier::Newest]);
        assert_eq!(Tier::Purchases.strategy(None), Strategy::PopularityGlobal);
        assert_eq!(Tier::Engagement.strategy(Some("a")), Strategy::TrendingCategory);
        assert_eq!(Tier::Newest.strategy(Some("a")), Strategy::NewestFallback);
    }
}
