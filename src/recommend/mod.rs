//! Recommendation retrieval: vector search with a cold-start fallback chain.

pub mod popular_cache;
pub mod service;

pub use popular_cache::{cache_key, PopularProductsCache};
pub use service::{RecommendationService, ANONYMOUS_USER};
