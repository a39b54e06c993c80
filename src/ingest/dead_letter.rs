//! Dead-letter path: publish to the DLQ topic, fall back to a local file.

use crate::error::{Error, Result};
use crate::model::BehaviorEvent;
use crate::stream::DeadLetterPublisher;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const FILE_PREFIX: &str = "failed_events_";

/// Append-only record of events that could not reach the DLQ topic. One file
/// per UTC day; a file over `max_bytes` is renamed to a timestamped backup
/// before the next append.
#[derive(Clone)]
pub struct FailedEventsFile {
    inner: Arc<FileInner>,
}

struct FileInner {
    dir: PathBuf,
    max_bytes: u64,
    // Serialises rotate-then-append across writers.
    lock: Mutex<()>,
}

impl FailedEventsFile {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(FileInner {
                dir: dir.into(),
                max_bytes,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn current_path(&self) -> PathBuf {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        self.inner.dir.join(format!("{}{}.log", FILE_PREFIX, date))
    }

    pub fn format_line(event: &BehaviorEvent) -> String {
        format!(
            "{}|{}|{}|{}|{}\n",
            chrono::Utc::now().to_rfc3339(),
            event.trace_id,
            event.user_id,
            event.product_id,
            event.action_type
        )
    }

    /// Blocking append. Returns the file written to.
    pub fn append(&self, event: &BehaviorEvent) -> Result<PathBuf> {
        let _guard = self.inner.lock.lock();

        fs::create_dir_all(&self.inner.dir)?;
        let path = self.current_path();

        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() > self.inner.max_bytes {
                self.rotate(&path);
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(Self::format_line(event).as_bytes())?;
        Ok(path)
    }

    pub async fn append_async(&self, event: &BehaviorEvent) -> Result<PathBuf> {
        let file = self.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || file.append(&event))
            .await
            .map_err(|e| Error::DeadLetter(format!("file writer task failed: {}", e)))?
    }

    fn rotate(&self, path: &Path) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "failed_events".to_string());
        let millis = chrono::Utc::now().timestamp_millis();

        let mut backup = self.inner.dir.join(format!("{}_{}.log", stem, millis));
        let mut n = 1;
        while backup.exists() {
            backup = self.inner.dir.join(format!("{}_{}_{}.log", stem, millis, n));
            n += 1;
        }

        match fs::rename(path, &backup) {
            Ok(()) => info!("Rotated failed events file to {}", backup.display()),
            Err(e) => warn!("Failed to rotate {}: {}", path.display(), e),
        }
    }
}

#[derive(Default)]
struct DeadLetterStats {
    sent: AtomicU64,
    publish_failed: AtomicU64,
    file_written: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterSnapshot {
    pub sent: u64,
    pub publish_failed: u64,
    pub file_written: u64,
}

pub struct DeadLetterProducer {
    publisher: Arc<dyn DeadLetterPublisher>,
    topic: String,
    fallback: FailedEventsFile,
    stats: DeadLetterStats,
}

impl DeadLetterProducer {
    pub fn new(publisher: Arc<dyn DeadLetterPublisher>, topic: impl Into<String>, fallback: FailedEventsFile) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            fallback,
            stats: DeadLetterStats::default(),
        }
    }

    /// Publish to the DLQ topic keyed by `userId`. On publish failure the event
    /// goes to the local file instead and `false` is returned. A file failure
    /// is logged and nothing further is attempted.
    pub async fn send(&self, event: &BehaviorEvent) -> bool {
        warn!("Sending event to DLQ: traceId={}", event.trace_id);

        match self.publisher.publish(&self.topic, &event.user_id, event).await {
            Ok(offset) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                info!("Event sent to DLQ: traceId={}, offset={}", event.trace_id, offset);
                true
            }
            Err(e) => {
                self.stats.publish_failed.fetch_add(1, Ordering::Relaxed);
                error!("Failed to send event to DLQ: traceId={}: {}", event.trace_id, e);

                match self.fallback.append_async(event).await {
                    Ok(path) => {
                        self.stats.file_written.fetch_add(1, Ordering::Relaxed);
                        warn!("Event written to {}: traceId={}", path.display(), event.trace_id);
                    }
                    Err(e) => {
                        error!("Failed to write failed event file: traceId={}: {}", event.trace_id, e);
                    }
                }
                false
            }
        }
    }

    pub fn stats(&self) -> DeadLetterSnapshot {
        DeadLetterSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            publish_failed: self.stats.publish_failed.load(Ordering::Relaxed),
            file_written: self.stats.file_written.load(Ordering::Relaxed),
        }
    }
}
