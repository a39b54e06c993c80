//! Batch pipeline: index, personalize, commit.

use super::bulk_indexer::BulkIndexer;
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::preference::PreferenceUpdater;
use crate::stream::{StreamBatch, StreamConsumer};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Where a batch ended up. `Committed` and `IndexFailed` are the only
/// terminal states `process_batch` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Received,
    Indexing,
    Indexed,
    PreferenceUpdate,
    Committed,
    IndexFailed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Received => "RECEIVED",
            BatchState::Indexing => "INDEXING",
            BatchState::Indexed => "INDEXED",
            BatchState::PreferenceUpdate => "PREFERENCE_UPDATE",
            BatchState::Committed => "COMMITTED",
            BatchState::IndexFailed => "INDEX_FAILED",
        };
        f.write_str(name)
    }
}

pub struct IngestionOrchestrator {
    stream: Arc<dyn StreamConsumer>,
    indexer: Arc<BulkIndexer>,
    updater: Arc<PreferenceUpdater>,
    config: ConsumerConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        stream: Arc<dyn StreamConsumer>,
        indexer: Arc<BulkIndexer>,
        updater: Arc<PreferenceUpdater>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            stream,
            indexer,
            updater,
            config,
        }
    }

    pub fn indexer(&self) -> &Arc<BulkIndexer> {
        &self.indexer
    }

    /// Run one batch through the pipeline. The offset is committed only when
    /// indexing did not exhaust its retries, and only as the last step.
    pub async fn process_batch(&self, batch: &StreamBatch) -> Result<BatchState> {
        let mut state = BatchState::Received;
        debug!(
            "Batch {} on partition {} [{}..{})",
            state, batch.partition, batch.first_offset, batch.next_offset
        );

        if !batch.events.is_empty() {
            state = BatchState::Indexing;
            debug!("Batch {}: {} events", state, batch.events.len());
            let outcome = self.indexer.index_batch(&batch.events).await;
            if outcome.exhausted {
                error!(
                    "Batch on partition {} [{}..{}) not committed: indexing failed",
                    batch.partition, batch.first_offset, batch.next_offset
                );
                return Ok(BatchState::IndexFailed);
            }
            state = BatchState::Indexed;
            debug!(
                "Batch {}: {} indexed, {} dead-lettered",
                state, outcome.success_count, outcome.dead_lettered
            );

            state = BatchState::PreferenceUpdate;
            debug!("Batch {}", state);
            self.update_preferences(batch).await;
        }

        self.stream.commit(batch.partition, batch.next_offset).await?;
        state = BatchState::Committed;
        info!(
            "Batch {}: partition {} offset {} ({} events)",
            state,
            batch.partition,
            batch.next_offset,
            batch.events.len()
        );
        Ok(state)
    }

    async fn update_preferences(&self, batch: &StreamBatch) {
        let timeout = self.config.preference_update_timeout();
        match tokio::time::timeout(timeout, self.updater.update_preferences_batch(&batch.events)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Preference update failed for partition {}: {}", batch.partition, e),
            Err(_) => warn!(
                "Preference update timed out after {:?} for partition {}",
                timeout, batch.partition
            ),
        }
    }

    fn owned_partitions(&self, worker_id: usize) -> Vec<u32> {
        let workers = self.config.concurrency.max(1);
        (0..self.stream.partitions())
            .filter(|p| *p as usize % workers == worker_id)
            .collect()
    }

    /// Poll the worker's partitions until the shutdown flag flips. A batch in
    /// progress is always finished before the flag is checked again.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let partitions = self.owned_partitions(worker_id);
        info!("Ingestion worker {} started for partitions {:?}", worker_id, partitions);
        if partitions.is_empty() {
            return;
        }

        while !*shutdown.borrow() {
            let mut idle = true;

            for &partition in &partitions {
                if *shutdown.borrow() {
                    break;
                }
                let batch = match self.stream.poll(partition, self.config.bulk_size).await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("Poll failed on partition {}: {}", partition, e);
                        continue;
                    }
                };
                idle = false;

                match self.process_batch(&batch).await {
                    Ok(BatchState::IndexFailed) => {
                        if let Err(e) = self.stream.rewind(partition).await {
                            error!("Rewind failed on partition {}: {}", partition, e);
                        }
                        warn!(
                            "Pausing worker {} for {:?} after failed batch",
                            worker_id,
                            self.config.failed_batch_pause()
                        );
                        Self::pause(&mut shutdown, self.config.failed_batch_pause()).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Commit failed on partition {}: {}", partition, e);
                        if let Err(e) = self.stream.rewind(partition).await {
                            error!("Rewind failed on partition {}: {}", partition, e);
                        }
                    }
                }
            }

            if idle {
                Self::pause(&mut shutdown, self.config.poll_interval()).await;
            }
        }

        info!("Ingestion worker {} stopped", worker_id);
    }

    async fn pause(shutdown: &mut watch::Receiver<bool>, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }

    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            workers.spawn(self.clone().run_worker(worker_id, shutdown.clone()));
        }
        workers
    }
}
