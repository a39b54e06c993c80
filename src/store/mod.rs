//! Storage seams.
//!
//! `FastStore` is the key-value store with TTL that holds preference vectors
//! and the popularity cache. `DocumentStore` is the searchable store holding
//! products (with embedded vectors), behavior records and preference backups.
//! Both ship with in-process implementations; networked clients implement the
//! same traits.

pub mod document;
pub mod fast;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;

pub use document::InMemoryDocumentStore;
pub use fast::InMemoryFastStore;

#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Write only when the key is missing or expired (`SET NX`). Returns
    /// whether the value was stored.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

/// One upsert inside a bulk request.
#[derive(Debug, Clone)]
pub struct BulkOperation {
    pub id: String,
    pub document: Value,
}

#[derive(Debug, Clone)]
pub struct BulkItem {
    pub id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub errors: bool,
    pub items: Vec<BulkItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Term { field: String, value: Value },
    Terms { field: String, values: Vec<Value> },
    ExcludeIds(Vec<String>),
    /// Numeric field strictly greater than `value`.
    GreaterThan { field: String, value: f64 },
    /// Numeric field greater than or equal to `value`.
    AtLeast { field: String, value: f64 },
}

impl Filter {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Filter::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::Terms {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub filters: Vec<Filter>,
    pub sort: Option<(String, SortOrder)>,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct KnnQuery {
    pub field: String,
    pub vector: Vec<f32>,
    pub k: usize,
    pub num_candidates: usize,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone)]
pub struct TermsAggregation {
    pub field: String,
    pub filters: Vec<Filter>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TermBucket {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Upsert every operation; the response carries one item per operation
    /// in request order.
    async fn bulk_upsert(&self, index: &str, operations: Vec<BulkOperation>) -> Result<BulkResponse>;

    async fn index(&self, index: &str, id: &str, document: Value) -> Result<()>;

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>>;

    /// Found documents only, in request order.
    async fn mget(&self, index: &str, ids: &[String]) -> Result<Vec<(String, Value)>>;

    async fn search(&self, index: &str, query: SearchQuery) -> Result<Vec<SearchHit>>;

    /// Nearest neighbours by cosine similarity, best first.
    async fn knn_search(&self, index: &str, query: KnnQuery) -> Result<Vec<SearchHit>>;

    /// Top buckets by document count, ties broken by key.
    async fn terms_aggregation(&self, index: &str, aggregation: TermsAggregation) -> Result<Vec<TermBucket>>;
}
