//! Durable bulk write of behavior events.

use super::dead_letter::DeadLetterProducer;
use crate::model::BehaviorEvent;
use crate::store::{BulkOperation, BulkResponse, DocumentStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOutcome {
    pub success_count: usize,
    pub dead_lettered: usize,
    /// Every retry failed; the whole batch went to the dead-letter path.
    pub exhausted: bool,
}

#[derive(Default)]
struct IndexerStats {
    success: AtomicU64,
    failed: AtomicU64,
    batch_failed: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerSnapshot {
    pub success: u64,
    pub failed: u64,
    pub batch_failed: u64,
    pub retries: u64,
}

pub struct BulkIndexer {
    store: Arc<dyn DocumentStore>,
    dead_letter: Arc<DeadLetterProducer>,
    index: String,
    max_retries: u32,
    retry_delay: Duration,
    stats: IndexerStats,
}

impl BulkIndexer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dead_letter: Arc<DeadLetterProducer>,
        index: impl Into<String>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            dead_letter,
            index: index.into(),
            max_retries: max_retries.max(1),
            retry_delay,
            stats: IndexerStats::default(),
        }
    }

    /// Write the batch with one bulk upsert per attempt, retrying the whole
    /// call with exponential backoff (`retry_delay * 2^attempt`).
    pub async fn index_batch(&self, events: &[BehaviorEvent]) -> BulkOutcome {
        if events.is_empty() {
            return BulkOutcome {
                success_count: 0,
                dead_lettered: 0,
                exhausted: false,
            };
        }

        debug!("Indexing batch of {} events to {}", events.len(), self.index);

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match self.store.bulk_upsert(&self.index, Self::build_operations(events)).await {
                Ok(response) => return self.handle_response(response, events).await,
                Err(e) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    if attempt + 1 < self.max_retries {
                        let delay = self.retry_delay * 2u32.saturating_pow(attempt);
                        warn!(
                            "Bulk indexing attempt {}/{} failed: {}, retrying in {:?}",
                            attempt + 1,
                            self.max_retries,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        error!(
            "Bulk indexing failed after {} attempts for {} events: {}",
            self.max_retries,
            events.len(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        );
        self.stats.batch_failed.fetch_add(1, Ordering::Relaxed);
        self.stats.failed.fetch_add(events.len() as u64, Ordering::Relaxed);

        for event in events {
            self.dead_letter.send(event).await;
        }

        BulkOutcome {
            success_count: 0,
            dead_lettered: events.len(),
            exhausted: true,
        }
    }

    fn build_operations(events: &[BehaviorEvent]) -> Vec<BulkOperation> {
        events
            .iter()
            .map(|event| BulkOperation {
                id: event.trace_id.clone(),
                document: event.to_document(),
            })
            .collect()
    }

    async fn handle_response(&self, response: BulkResponse, events: &[BehaviorEvent]) -> BulkOutcome {
        if !response.errors && response.items.len() == events.len() {
            self.stats.success.fetch_add(events.len() as u64, Ordering::Relaxed);
            info!("Bulk indexed {}/{} documents to {}", events.len(), events.len(), self.index);
            return BulkOutcome {
                success_count: events.len(),
                dead_lettered: 0,
                exhausted: false,
            };
        }

        let mut success_count = 0;
        let mut dead_lettered = 0;

        for (i, item) in response.items.iter().enumerate() {
            let Some(event) = events.get(i) else {
                error!(
                    "Bulk response item {} (id={}) out of bounds for batch of {}",
                    i,
                    item.id,
                    events.len()
                );
                continue;
            };

            match &item.error {
                Some(reason) => {
                    error!("Failed to index document {}: {}", event.trace_id, reason);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    self.dead_letter.send(event).await;
                    dead_lettered += 1;
                }
                None => {
                    self.stats.success.fetch_add(1, Ordering::Relaxed);
                    success_count += 1;
                }
            }
        }

        if response.items.len() < events.len() {
            let missing = &events[response.items.len()..];
            error!(
                "Bulk response has {} items for {} events; dead-lettering {} unacknowledged events",
                response.items.len(),
                events.len(),
                missing.len()
            );
            for event in missing {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.dead_letter.send(event).await;
                dead_lettered += 1;
            }
        }

        if success_count > 0 {
            info!("Bulk indexed {}/{} documents to {}", success_count, events.len(), self.index);
        }

        BulkOutcome {
            success_count,
            dead_lettered,
            exhausted: false,
        }
    }

    pub fn stats(&self) -> IndexerSnapshot {
        IndexerSnapshot {
            success: self.stats.success.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            batch_failed: self.stats.batch_failed.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }
}
