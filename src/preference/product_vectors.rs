use crate::error::Result;
use crate::model::ProductDocument;
use crate::store::DocumentStore;
use ahash::AHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Read-only access to product vectors in the catalog index.
pub struct ProductVectors {
    store: Arc<dyn DocumentStore>,
    index: String,
    dimension: usize,
}

impl ProductVectors {
    pub fn new(store: Arc<dyn DocumentStore>, index: impl Into<String>, dimension: usize) -> Self {
        Self {
            store,
            index: index.into(),
            dimension,
        }
    }

    fn extract(&self, id: &str, source: Value) -> Option<Vec<f32>> {
        let doc: ProductDocument = match serde_json::from_value(source) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Product {} has an unreadable document: {}", id, e);
                return None;
            }
        };
        let vector = doc.product_vector?;
        if vector.len() != self.dimension {
            warn!(
                "Product {} has invalid vector dimension: {}, expected: {}",
                id,
                vector.len(),
                self.dimension
            );
            return None;
        }
        Some(vector)
    }

    pub async fn get(&self, product_id: &str) -> Result<Option<Vec<f32>>> {
        match self.store.get(&self.index, product_id).await? {
            Some(source) => Ok(self.extract(product_id, source)),
            None => {
                debug!("Product not found: {}", product_id);
                Ok(None)
            }
        }
    }

    pub async fn get_many(&self, product_ids: &[String]) -> Result<AHashMap<String, Vec<f32>>> {
        if product_ids.is_empty() {
            return Ok(AHashMap::new());
        }
        let docs = self.store.mget(&self.index, product_ids).await?;
        Ok(docs
            .into_iter()
            .filter_map(|(id, source)| self.extract(&id, source).map(|v| (id, v)))
            .collect())
    }
}
