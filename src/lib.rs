//! Real-time personalization core: behavior events in, preference vectors
//! updated, recommendations served by vector search with cold-start
//! fallbacks.

pub mod app;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lock_registry;
pub mod model;
pub mod preference;
pub mod recommend;
pub mod server;
pub mod store;
pub mod stream;
pub mod vector;

pub use app::Services;
pub use config::Config;
pub use error::{Error, Result};
pub use server::{create_app, AppState};
