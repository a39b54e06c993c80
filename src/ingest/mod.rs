//! Stream ingestion: durable bulk indexing behind an offset-commit gate.

pub mod bulk_indexer;
pub mod dead_letter;
pub mod orchestrator;

pub use bulk_indexer::{BulkIndexer, BulkOutcome, IndexerSnapshot};
pub use dead_letter::{DeadLetterProducer, DeadLetterSnapshot, FailedEventsFile};
pub use orchestrator::{BatchState, IngestionOrchestrator};
