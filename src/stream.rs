//! Event stream seams: the partitioned behavior topic consumed in batches
//! with manual commit, and the dead-letter topic.

use crate::error::{Error, Result};
use crate::model::BehaviorEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

/// Records fetched from one partition. `next_offset` is what gets committed
/// once the batch is durable.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub partition: u32,
    pub first_offset: u64,
    pub next_offset: u64,
    pub events: Vec<BehaviorEvent>,
}

#[async_trait]
pub trait StreamConsumer: Send + Sync {
    fn partitions(&self) -> u32;

    /// Fetch up to `max_records` from the partition's fetch position and
    /// advance it. `None` when nothing new is available.
    async fn poll(&self, partition: u32, max_records: usize) -> Result<Option<StreamBatch>>;

    async fn commit(&self, partition: u32, next_offset: u64) -> Result<()>;

    /// Move the fetch position back to the committed offset so uncommitted
    /// records are delivered again.
    async fn rewind(&self, partition: u32) -> Result<()>;
}

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish synchronously; returns the record offset on the topic.
    async fn publish(&self, topic: &str, key: &str, event: &BehaviorEvent) -> Result<u64>;
}

struct Partition {
    log: Vec<BehaviorEvent>,
    position: u64,
    committed: u64,
}

/// Partitioned append-only log with one consumer group.
pub struct InMemoryStream {
    topic: String,
    partitions: Vec<Mutex<Partition>>,
    hasher: ahash::RandomState,
}

impl InMemoryStream {
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                Mutex::new(Partition {
                    log: Vec::new(),
                    position: 0,
                    committed: 0,
                })
            })
            .collect();

        Self {
            topic: topic.into(),
            partitions,
            // Fixed seeds keep key-to-partition assignment stable across restarts.
            hasher: ahash::RandomState::with_seeds(0x5eed, 0xbeef, 0xcafe, 0xf00d),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }

    /// Append keyed by `userId`, so one user's events stay ordered within a
    /// single partition. Returns `(partition, offset)`.
    pub fn produce(&self, event: BehaviorEvent) -> (u32, u64) {
        let partition = self.partition_for(&event.user_id);
        let mut p = self.partitions[partition as usize].lock();
        p.log.push(event);
        (partition, p.log.len() as u64 - 1)
    }

    pub fn committed_offset(&self, partition: u32) -> Option<u64> {
        self.partitions.get(partition as usize).map(|p| p.lock().committed)
    }

    /// Records not yet committed, across all partitions.
    pub fn lag(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| {
                let p = p.lock();
                p.log.len() as u64 - p.committed
            })
            .sum()
    }

    /// What a consumer restart looks like: every fetch position falls back to
    /// the committed offset.
    pub fn reset_to_committed(&self) {
        for p in &self.partitions {
            let mut p = p.lock();
            p.position = p.committed;
        }
    }

    fn partition(&self, partition: u32) -> Result<&Mutex<Partition>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| Error::stream(format!("{} has no partition {}", self.topic, partition)))
    }
}

#[async_trait]
impl StreamConsumer for InMemoryStream {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn poll(&self, partition: u32, max_records: usize) -> Result<Option<StreamBatch>> {
        let mut p = self.partition(partition)?.lock();
        let start = p.position as usize;
        if start >= p.log.len() {
            return Ok(None);
        }
        let end = (start + max_records.max(1)).min(p.log.len());
        let events = p.log[start..end].to_vec();
        p.position = end as u64;

        Ok(Some(StreamBatch {
            partition,
            first_offset: start as u64,
            next_offset: end as u64,
            events,
        }))
    }

    async fn commit(&self, partition: u32, next_offset: u64) -> Result<()> {
        let mut p = self.partition(partition)?.lock();
        if next_offset > p.log.len() as u64 {
            return Err(Error::stream(format!(
                "commit offset {} beyond end of partition {} ({})",
                next_offset,
                partition,
                p.log.len()
            )));
        }
        p.committed = p.committed.max(next_offset);
        Ok(())
    }

    async fn rewind(&self, partition: u32) -> Result<()> {
        let mut p = self.partition(partition)?.lock();
        p.position = p.committed;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub topic: String,
    pub key: String,
    pub event: BehaviorEvent,
}

/// Dead-letter topic held in memory. Can be switched unavailable to model a
/// broker outage.
pub struct InMemoryDeadLetterTopic {
    records: Mutex<Vec<DeadLetterRecord>>,
    available: AtomicBool,
}

impl InMemoryDeadLetterTopic {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

impl Default for InMemoryDeadLetterTopic {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterPublisher for InMemoryDeadLetterTopic {
    async fn publish(&self, topic: &str, key: &str, event: &BehaviorEvent) -> Result<u64> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::DeadLetter(format!("broker unavailable for {}", topic)));
        }
        let mut records = self.records.lock();
        records.push(DeadLetterRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            event: event.clone(),
        });
        Ok(records.len() as u64 - 1)
    }
}
