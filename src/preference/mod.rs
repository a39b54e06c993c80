//! Preference vector engine.

pub mod calculator;
pub mod product_vectors;
pub mod repository;
pub mod updater;

pub use calculator::PreferenceVectorCalculator;
pub use product_vectors::ProductVectors;
pub use repository::{preference_key, PreferenceRepository};
pub use updater::{PreferenceUpdater, UpdaterSnapshot};
