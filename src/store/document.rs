use super::{
    BulkItem, BulkOperation, BulkResponse, DocumentStore, Filter, KnnQuery, SearchHit, SearchQuery, SortOrder,
    TermBucket, TermsAggregation,
};
use crate::error::{Error, Result};
use crate::vector::cosine_similarity;
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use dashmap::DashMap;
use rayon::prelude::*;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct ScoredDoc {
    score: f32,
    id: String,
    source: Arc<Value>,
}

impl PartialEq for ScoredDoc {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredDoc {}

impl PartialOrd for ScoredDoc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap keeps the worst candidate on top.
impl Ord for ScoredDoc {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

struct Index {
    documents: DashMap<String, Arc<Value>>,
}

impl Index {
    fn new() -> Self {
        Self {
            documents: DashMap::with_capacity(10_000),
        }
    }

    fn snapshot(&self) -> Vec<(String, Arc<Value>)> {
        self.documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Filters with their lookup sets built once per query.
struct CompiledFilters<'a> {
    filters: &'a [Filter],
    excluded: AHashSet<&'a str>,
}

impl<'a> CompiledFilters<'a> {
    fn new(filters: &'a [Filter]) -> Self {
        let excluded = filters
            .iter()
            .filter_map(|f| match f {
                Filter::ExcludeIds(ids) => Some(ids.iter().map(String::as_str)),
                _ => None,
            })
            .flatten()
            .collect();
        Self { filters, excluded }
    }

    fn matches(&self, id: &str, doc: &Value) -> bool {
        if self.excluded.contains(id) {
            return false;
        }
        self.filters.iter().all(|filter| match filter {
            Filter::Term { field, value } => doc.get(field).is_some_and(|v| values_equal(v, value)),
            Filter::Terms { field, values } => doc
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| values_equal(v, candidate))),
            Filter::ExcludeIds(_) => true,
            Filter::GreaterThan { field, value } => {
                doc.get(field).and_then(Value::as_f64).is_some_and(|v| v > *value)
            }
            Filter::AtLeast { field, value } => {
                doc.get(field).and_then(Value::as_f64).is_some_and(|v| v >= *value)
            }
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn term_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => x.as_str().unwrap_or_default().cmp(y.as_str().unwrap_or_default()),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn extract_vector(doc: &Value, field: &str) -> Option<Vec<f32>> {
    doc.get(field)?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Exact cosine scoring of every filtered document, keeping the best
/// `num_candidates` in a bounded heap and returning the top `k`.
fn top_k(pool: &rayon::ThreadPool, documents: &[(String, Arc<Value>)], query: &KnnQuery) -> Vec<SearchHit> {
    let filters = CompiledFilters::new(&query.filters);
    let dim = query.vector.len();

    let scored: Vec<ScoredDoc> = pool.install(|| {
        documents
            .par_iter()
            .filter(|(id, doc)| filters.matches(id, doc))
            .filter_map(|(id, doc)| {
                let vector = extract_vector(doc, &query.field)?;
                if vector.len() != dim {
                    return None;
                }
                Some(ScoredDoc {
                    score: cosine_similarity(&query.vector, &vector),
                    id: id.clone(),
                    source: doc.clone(),
                })
            })
            .collect()
    });

    let capacity = query.num_candidates.max(query.k);
    let mut heap = BinaryHeap::with_capacity(capacity + 1);
    for doc in scored {
        if heap.len() < capacity {
            heap.push(doc);
        } else if heap.peek().is_some_and(|worst: &ScoredDoc| doc.score > worst.score) {
            heap.pop();
            heap.push(doc);
        }
    }

    // into_sorted_vec is ascending by Ord, which is best-first here.
    let mut results: Vec<SearchHit> = heap
        .into_sorted_vec()
        .into_iter()
        .map(|scored| SearchHit {
            id: scored.id,
            // Cosine mapped into [0, 1].
            score: ((1.0 + scored.score) / 2.0) as f64,
            source: scored.source.as_ref().clone(),
        })
        .collect();
    results.truncate(query.k);
    results
}

/// In-process document store: one concurrent map per index, exact cosine
/// search fanned out over a rayon pool.
pub struct InMemoryDocumentStore {
    indices: DashMap<String, Arc<Index>>,
    thread_pool: Arc<rayon::ThreadPool>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Result<Self> {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get())
            .build()
            .map_err(|e| Error::store(format!("failed to build search pool: {}", e)))?;

        Ok(Self {
            indices: DashMap::new(),
            thread_pool: Arc::new(thread_pool),
        })
    }

    fn get_or_create_index(&self, name: &str) -> Arc<Index> {
        if let Some(index) = self.indices.get(name) {
            return index.clone();
        }
        self.indices
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Index::new()))
            .clone()
    }

    fn existing_index(&self, name: &str) -> Option<Arc<Index>> {
        self.indices.get(name).map(|index| index.clone())
    }

    pub fn count(&self, index: &str) -> usize {
        self.existing_index(index).map_or(0, |i| i.documents.len())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn bulk_upsert(&self, index: &str, operations: Vec<BulkOperation>) -> Result<BulkResponse> {
        let target = self.get_or_create_index(index);
        let mut response = BulkResponse {
            errors: false,
            items: Vec::with_capacity(operations.len()),
        };

        for op in operations {
            if !op.document.is_object() {
                response.errors = true;
                response.items.push(BulkItem {
                    id: op.id,
                    error: Some("mapper_parsing_exception: document must be a JSON object".to_string()),
                });
                continue;
            }
            target.documents.insert(op.id.clone(), Arc::new(op.document));
            response.items.push(BulkItem { id: op.id, error: None });
        }

        Ok(response)
    }

    async fn index(&self, index: &str, id: &str, document: Value) -> Result<()> {
        if !document.is_object() {
            return Err(Error::InvalidRequest(format!("document {} must be a JSON object", id)));
        }
        self.get_or_create_index(index)
            .documents
            .insert(id.to_string(), Arc::new(document));
        Ok(())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .existing_index(index)
            .and_then(|i| i.documents.get(id).map(|doc| doc.as_ref().clone())))
    }

    async fn mget(&self, index: &str, ids: &[String]) -> Result<Vec<(String, Value)>> {
        let Some(target) = self.existing_index(index) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| target.documents.get(id).map(|doc| (id.clone(), doc.as_ref().clone())))
            .collect())
    }

    async fn search(&self, index: &str, query: SearchQuery) -> Result<Vec<SearchHit>> {
        let Some(target) = self.existing_index(index) else {
            return Ok(Vec::new());
        };
        let filters = CompiledFilters::new(&query.filters);

        let mut hits: Vec<(String, Arc<Value>)> = target
            .snapshot()
            .into_iter()
            .filter(|(id, doc)| filters.matches(id, doc))
            .collect();

        if let Some((field, order)) = &query.sort {
            hits.sort_by(|a, b| {
                let ord = compare_field(&a.1, &b.1, field);
                let ord = if *order == SortOrder::Desc { ord.reverse() } else { ord };
                ord.then_with(|| a.0.cmp(&b.0))
            });
        } else {
            hits.sort_by(|a, b| a.0.cmp(&b.0));
        }
        hits.truncate(query.size);

        Ok(hits
            .into_iter()
            .map(|(id, doc)| SearchHit {
                id,
                score: 0.0,
                source: doc.as_ref().clone(),
            })
            .collect())
    }

    async fn knn_search(&self, index: &str, query: KnnQuery) -> Result<Vec<SearchHit>> {
        let Some(target) = self.existing_index(index) else {
            return Ok(Vec::new());
        };
        if query.k == 0 {
            return Ok(Vec::new());
        }

        let documents = target.snapshot();
        let scanned = documents.len();
        let pool = self.thread_pool.clone();
        // Scoring runs on the rayon pool; the async worker only waits on it.
        let results = tokio::task::spawn_blocking(move || top_k(&pool, &documents, &query))
            .await
            .map_err(|e| Error::store(format!("knn search task failed: {}", e)))?;

        debug!("knn over {} docs in {} returned {} hits", scanned, index, results.len());
        Ok(results)
    }

    async fn terms_aggregation(&self, index: &str, aggregation: TermsAggregation) -> Result<Vec<TermBucket>> {
        let Some(target) = self.existing_index(index) else {
            return Ok(Vec::new());
        };
        let filters = CompiledFilters::new(&aggregation.filters);

        let mut counts: AHashMap<String, u64> = AHashMap::new();
        for entry in target.documents.iter() {
            let doc = entry.value();
            if !filters.matches(entry.key(), doc) {
                continue;
            }
            if let Some(key) = doc.get(&aggregation.field).and_then(term_key) {
                *counts.entry(key).or_insert(0) += 1;
            }
        }

        let mut buckets: Vec<TermBucket> = counts
            .into_iter()
            .map(|(key, count)| TermBucket { key, count })
            .collect();
        buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        buckets.truncate(aggregation.size);
        Ok(buckets)
    }
}
