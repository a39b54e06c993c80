use super::popular_cache::PopularProductsCache;
use crate::config::{IndexNames, RecommendationConfig};
use crate::error::Result;
use crate::model::{now_millis, ProductDocument, ProductRecommendation, RecommendationResult, Strategy};
use crate::preference::PreferenceRepository;
use crate::store::{DocumentStore, Filter, KnnQuery, SearchQuery, SortOrder};
use ahash::AHashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const ANONYMOUS_USER: &str = "_anonymous_";
const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

pub struct RecommendationService {
    preferences: Arc<PreferenceRepository>,
    documents: Arc<dyn DocumentStore>,
    popular: Arc<PopularProductsCache>,
    indices: IndexNames,
    config: RecommendationConfig,
}

impl RecommendationService {
    pub fn new(
        preferences: Arc<PreferenceRepository>,
        documents: Arc<dyn DocumentStore>,
        popular: Arc<PopularProductsCache>,
        indices: IndexNames,
        config: RecommendationConfig,
    ) -> Self {
        Self {
            preferences,
            documents,
            popular,
            indices,
            config,
        }
    }

    pub fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit.max(1))
    }

    /// Personalized list for `user_id`. Never fails: any error degrades to
    /// the global popularity list tagged `error-fallback`.
    pub async fn recommend(
        &self,
        user_id: &str,
        limit: Option<usize>,
        category: Option<&str>,
        exclude_viewed: bool,
    ) -> RecommendationResult {
        self.respond(Some(user_id), limit, category, exclude_viewed).await
    }

    /// Cold-start list for anonymous traffic, reported under `_anonymous_`.
    pub async fn popular(&self, limit: Option<usize>, category: Option<&str>) -> RecommendationResult {
        self.respond(None, limit, category, false).await
    }

    async fn respond(
        &self,
        user_id: Option<&str>,
        limit: Option<usize>,
        category: Option<&str>,
        exclude_viewed: bool,
    ) -> RecommendationResult {
        let start = Instant::now();
        let limit = self.clamp_limit(limit);
        let shown_as = user_id.unwrap_or(ANONYMOUS_USER);

        let (recommendations, strategy) = match self.execute(user_id, limit, category, exclude_viewed).await {
            Ok(result) => result,
            Err(e) => {
                error!("Recommendation failed for user {}: {}", shown_as, e);
                (self.error_fallback(limit).await, Strategy::ErrorFallback)
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        info!(
            "Recommended {} products to {} via {} in {}ms",
            recommendations.len(),
            shown_as,
            strategy,
            latency_ms
        );

        RecommendationResult {
            user_id: shown_as.to_string(),
            recommendations,
            strategy,
            latency_ms,
        }
    }

    /// `None` is anonymous traffic, which always takes the cold-start chain.
    async fn execute(
        &self,
        user_id: Option<&str>,
        limit: usize,
        category: Option<&str>,
        exclude_viewed: bool,
    ) -> Result<(Vec<ProductRecommendation>, Strategy)> {
        let Some(user_id) = user_id else {
            return self.popular.top_products(limit, category).await;
        };

        let Some(preference) = self.preferences.get(user_id).await? else {
            debug!("Cold start for user {}", user_id);
            return self.popular.top_products(limit, category).await;
        };

        let exclude_ids = if exclude_viewed {
            self.recently_viewed(user_id).await?
        } else {
            Vec::new()
        };

        let products = self
            .search_similar(preference.vector, limit, category, exclude_ids)
            .await?;
        if products.is_empty() {
            debug!("Vector search empty for user {}, using popularity", user_id);
            return self.popular.top_products(limit, category).await;
        }

        Ok((products, Strategy::VectorSearch))
    }

    async fn search_similar(
        &self,
        vector: Vec<f32>,
        limit: usize,
        category: Option<&str>,
        exclude_ids: Vec<String>,
    ) -> Result<Vec<ProductRecommendation>> {
        let mut filters = vec![Filter::GreaterThan {
            field: "stock".to_string(),
            value: 0.0,
        }];
        if let Some(category) = category {
            filters.push(Filter::term("category", category));
        }
        if !exclude_ids.is_empty() {
            filters.push(Filter::ExcludeIds(exclude_ids));
        }

        let hits = self
            .documents
            .knn_search(
                &self.indices.product,
                KnnQuery {
                    field: "productVector".to_string(),
                    vector,
                    k: limit,
                    num_candidates: limit * self.config.num_candidates_multiplier,
                    filters,
                },
            )
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| match serde_json::from_value::<ProductDocument>(hit.source) {
                Ok(doc) => Some(ProductRecommendation::from_document(&hit.id, doc, hit.score)),
                Err(e) => {
                    warn!("Skipping unreadable product {}: {}", hit.id, e);
                    None
                }
            })
            .collect())
    }

    /// Distinct product ids the user touched inside the behavior window,
    /// newest first.
    pub async fn recently_viewed(&self, user_id: &str) -> Result<Vec<String>> {
        let since = now_millis() - self.config.behavior_window_days * DAY_MILLIS;
        let hits = self
            .documents
            .search(
                &self.indices.behavior,
                SearchQuery {
                    filters: vec![
                        Filter::term("userId", user_id),
                        Filter::AtLeast {
                            field: "timestamp".to_string(),
                            value: since as f64,
                        },
                    ],
                    sort: Some(("timestamp".to_string(), SortOrder::Desc)),
                    size: self.config.recent_viewed_limit,
                },
            )
            .await?;

        let mut seen = AHashSet::new();
        Ok(hits
            .into_iter()
            .filter_map(|hit| hit.source.get("productId")?.as_str().map(str::to_string))
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    async fn error_fallback(&self, limit: usize) -> Vec<ProductRecommendation> {
        match self.popular.top_products(limit, None).await {
            Ok((products, _)) => products,
            Err(e) => {
                error!("Popular fallback failed too: {}", e);
                Vec::new()
            }
        }
    }
}
