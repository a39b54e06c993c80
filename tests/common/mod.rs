#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use realtime_personalization::config::{CacheConfig, IndexNames};
use realtime_personalization::error::{Error, Result};
use realtime_personalization::ingest::{BulkIndexer, DeadLetterProducer, FailedEventsFile};
use realtime_personalization::model::{now_millis, ActionType, BehaviorEvent, ProductDocument};
use realtime_personalization::preference::{
    PreferenceRepository, PreferenceUpdater, PreferenceVectorCalculator, ProductVectors,
};
use realtime_personalization::store::{
    BulkOperation, BulkResponse, DocumentStore, FastStore, InMemoryDocumentStore, InMemoryFastStore, KnnQuery,
    SearchHit, SearchQuery, TermBucket, TermsAggregation,
};
use realtime_personalization::stream::InMemoryDeadLetterTopic;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

pub const DIM: usize = 4;
pub const PRODUCTS: &str = "product_index";
pub const BEHAVIOR: &str = "user_behavior_index";
pub const PREFERENCES: &str = "user_preference_index";

pub fn event(trace: &str, user: &str, product: &str, action: ActionType) -> BehaviorEvent {
    BehaviorEvent {
        trace_id: trace.to_string(),
        user_id: user.to_string(),
        product_id: product.to_string(),
        category: "general".to_string(),
        action_type: action,
        metadata: HashMap::new(),
        timestamp: now_millis(),
    }
}

pub fn product(id: &str, category: &str, vector: Vec<f32>, stock: i64) -> Value {
    serde_json::to_value(ProductDocument {
        product_id: id.to_string(),
        product_name: format!("Product {}", id),
        category: category.to_string(),
        price: 19.99,
        stock: Some(stock),
        product_vector: Some(vector),
        created_at: Some(now_millis()),
    })
    .unwrap()
}

/// Document store wrapper that injects failures and records calls.
pub struct FaultyDocumentStore {
    pub inner: Arc<InMemoryDocumentStore>,
    bulk_failures: AtomicUsize,
    item_errors: Mutex<HashSet<String>>,
    dropped_items: AtomicUsize,
    fail_knn: AtomicBool,
    aggregation_calls: AtomicU64,
    aggregation_delay: Mutex<Duration>,
    aggregation_barrier: Mutex<Option<Arc<Barrier>>>,
    get_delay: Mutex<Duration>,
    index_delays: Mutex<VecDeque<Duration>>,
    pub bulk_calls: AtomicU64,
}

impl FaultyDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryDocumentStore::new().unwrap()),
            bulk_failures: AtomicUsize::new(0),
            item_errors: Mutex::new(HashSet::new()),
            dropped_items: AtomicUsize::new(0),
            fail_knn: AtomicBool::new(false),
            aggregation_calls: AtomicU64::new(0),
            aggregation_delay: Mutex::new(Duration::ZERO),
            aggregation_barrier: Mutex::new(None),
            get_delay: Mutex::new(Duration::ZERO),
            index_delays: Mutex::new(VecDeque::new()),
            bulk_calls: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` bulk calls outright (`usize::MAX` for always).
    pub fn fail_bulk(&self, n: usize) {
        self.bulk_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_item(&self, id: &str) {
        self.item_errors.lock().insert(id.to_string());
    }

    /// Answer bulk calls with `n` fewer items than operations.
    pub fn drop_items(&self, n: usize) {
        self.dropped_items.store(n, Ordering::SeqCst);
    }

    pub fn fail_knn(&self, fail: bool) {
        self.fail_knn.store(fail, Ordering::SeqCst);
    }

    pub fn slow_aggregations(&self, delay: Duration) {
        *self.aggregation_delay.lock() = delay;
    }

    pub fn gate_aggregations(&self, barrier: Arc<Barrier>) {
        *self.aggregation_barrier.lock() = Some(barrier);
    }

    /// Answer single-document reads after `delay`, with the value read at
    /// call time.
    pub fn slow_gets(&self, delay: Duration) {
        *self.get_delay.lock() = delay;
    }

    /// Delay the next single-document `index` call; queued delays apply in
    /// call order.
    pub fn delay_next_index(&self, delay: Duration) {
        self.index_delays.lock().push_back(delay);
    }

    pub fn aggregation_calls(&self) -> u64 {
        self.aggregation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for FaultyDocumentStore {
    async fn bulk_upsert(&self, index: &str, operations: Vec<BulkOperation>) -> Result<BulkResponse> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.bulk_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.bulk_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(Error::store("connection refused"));
        }

        let failing = self.item_errors.lock().clone();
        let (bad, good): (Vec<_>, Vec<_>) = operations.into_iter().partition(|op| failing.contains(&op.id));
        let order: Vec<String> = good.iter().chain(bad.iter()).map(|op| op.id.clone()).collect();
        let mut response = self.inner.bulk_upsert(index, good).await?;
        for op in bad {
            response.errors = true;
            response.items.push(realtime_personalization::store::BulkItem {
                id: op.id,
                error: Some("version_conflict_engine_exception".to_string()),
            });
        }

        // Restore request order.
        let mut by_id: HashMap<String, _> = response.items.drain(..).map(|item| (item.id.clone(), item)).collect();
        response.items = order.iter().filter_map(|id| by_id.remove(id)).collect();

        let dropped = self.dropped_items.load(Ordering::SeqCst);
        let keep = response.items.len().saturating_sub(dropped);
        response.items.truncate(keep);
        Ok(response)
    }

    async fn index(&self, index: &str, id: &str, document: Value) -> Result<()> {
        let delay = self.index_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.index(index, id, document).await
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let found = self.inner.get(index, id).await;
        let delay = *self.get_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        found
    }

    async fn mget(&self, index: &str, ids: &[String]) -> Result<Vec<(String, Value)>> {
        self.inner.mget(index, ids).await
    }

    async fn search(&self, index: &str, query: SearchQuery) -> Result<Vec<SearchHit>> {
        self.inner.search(index, query).await
    }

    async fn knn_search(&self, index: &str, query: KnnQuery) -> Result<Vec<SearchHit>> {
        if self.fail_knn.load(Ordering::SeqCst) {
            return Err(Error::store("knn search unavailable"));
        }
        self.inner.knn_search(index, query).await
    }

    async fn terms_aggregation(&self, index: &str, aggregation: TermsAggregation) -> Result<Vec<TermBucket>> {
        self.aggregation_calls.fetch_add(1, Ordering::SeqCst);
        let barrier = self.aggregation_barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let delay = *self.aggregation_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.terms_aggregation(index, aggregation).await
    }
}

/// Fast store wrapper with configurable read latency and write failures.
pub struct FaultyFastStore {
    pub inner: InMemoryFastStore,
    read_delay: Mutex<Duration>,
    fail_writes: AtomicBool,
    pub reads: AtomicU64,
}

impl FaultyFastStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryFastStore::new(),
            read_delay: Mutex::new(Duration::ZERO),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    pub fn slow_reads(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FastStore for FaultyFastStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::store("READONLY replica"));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::store("READONLY replica"));
        }
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }
}

pub fn repository(
    fast: Arc<dyn FastStore>,
    documents: Arc<dyn DocumentStore>,
    read_timeout: Duration,
) -> Arc<PreferenceRepository> {
    Arc::new(PreferenceRepository::new(
        fast,
        documents,
        PREFERENCES,
        Duration::from_secs(3600),
        read_timeout,
    ))
}

pub fn updater(documents: Arc<dyn DocumentStore>, repository: Arc<PreferenceRepository>) -> Arc<PreferenceUpdater> {
    Arc::new(PreferenceUpdater::new(
        PreferenceVectorCalculator::new(DIM),
        ProductVectors::new(documents, PRODUCTS, DIM),
        repository,
    ))
}

pub fn indexer(
    documents: Arc<dyn DocumentStore>,
    dlq_dir: &Path,
    max_retries: u32,
) -> (Arc<BulkIndexer>, Arc<InMemoryDeadLetterTopic>) {
    let topic = Arc::new(InMemoryDeadLetterTopic::new());
    let producer = Arc::new(DeadLetterProducer::new(
        topic.clone(),
        "user.action.v1.dlq",
        FailedEventsFile::new(dlq_dir, 1024 * 1024),
    ));
    let indexer = Arc::new(BulkIndexer::new(
        documents,
        producer,
        BEHAVIOR,
        max_retries,
        Duration::from_millis(1),
    ));
    (indexer, topic)
}

pub fn cache_config() -> CacheConfig {
    CacheConfig::default()
}

pub fn index_names() -> IndexNames {
    IndexNames::default()
}
