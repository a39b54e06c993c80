//! Component wiring for the in-process deployment.

use crate::config::Config;
use crate::error::Result;
use crate::ingest::{BulkIndexer, DeadLetterProducer, FailedEventsFile, IngestionOrchestrator};
use crate::model::{now_millis, ProductDocument};
use crate::preference::{PreferenceRepository, PreferenceUpdater, PreferenceVectorCalculator, ProductVectors};
use crate::recommend::{PopularProductsCache, RecommendationService};
use crate::server::AppState;
use crate::store::{BulkOperation, DocumentStore, InMemoryDocumentStore, InMemoryFastStore};
use crate::stream::{InMemoryDeadLetterTopic, InMemoryStream};
use crate::vector::normalize;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

pub const DEMO_CATEGORIES: [&str; 6] = ["electronics", "fashion", "home", "beauty", "sports", "books"];

pub struct Services {
    pub config: Config,
    pub fast: Arc<InMemoryFastStore>,
    pub documents: Arc<InMemoryDocumentStore>,
    pub stream: Arc<InMemoryStream>,
    pub dead_letter_topic: Arc<InMemoryDeadLetterTopic>,
    pub repository: Arc<PreferenceRepository>,
    pub updater: Arc<PreferenceUpdater>,
    pub popular: Arc<PopularProductsCache>,
    pub recommendations: Arc<RecommendationService>,
    pub orchestrator: Arc<IngestionOrchestrator>,
}

impl Services {
    pub fn build(config: Config) -> Result<Self> {
        let fast = Arc::new(InMemoryFastStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new()?);
        let stream = Arc::new(InMemoryStream::new(&config.consumer.topic, config.consumer.partitions));
        let dead_letter_topic = Arc::new(InMemoryDeadLetterTopic::new());

        let repository = Arc::new(PreferenceRepository::new(
            fast.clone(),
            documents.clone(),
            &config.indices.preference,
            config.preference.ttl(),
            config.preference.read_timeout(),
        ));
        let updater = Arc::new(PreferenceUpdater::new(
            PreferenceVectorCalculator::new(config.vector.dimension),
            ProductVectors::new(documents.clone(), &config.indices.product, config.vector.dimension),
            repository.clone(),
        ));

        let dead_letter = Arc::new(DeadLetterProducer::new(
            dead_letter_topic.clone(),
            &config.consumer.dlq_topic,
            FailedEventsFile::new(&config.consumer.dlq_logs_dir, config.consumer.dlq_file_max_size_bytes),
        ));
        let indexer = Arc::new(BulkIndexer::new(
            documents.clone(),
            dead_letter,
            &config.indices.behavior,
            config.consumer.max_retries,
            config.consumer.retry_delay(),
        ));
        let orchestrator = Arc::new(IngestionOrchestrator::new(
            stream.clone(),
            indexer,
            updater.clone(),
            config.consumer.clone(),
        ));

        let popular = Arc::new(PopularProductsCache::new(
            fast.clone(),
            documents.clone(),
            config.indices.clone(),
            config.cache.clone(),
            config.recommendation.behavior_window_days,
        ));
        let recommendations = Arc::new(RecommendationService::new(
            repository.clone(),
            documents.clone(),
            popular.clone(),
            config.indices.clone(),
            config.recommendation.clone(),
        ));

        Ok(Self {
            config,
            fast,
            documents,
            stream,
            dead_letter_topic,
            repository,
            updater,
            popular,
            recommendations,
            orchestrator,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            recommendations: self.recommendations.clone(),
            stream: self.stream.clone(),
        }
    }

    /// Fill the product index with `count` synthetic products whose vectors
    /// cluster by category.
    pub async fn seed_demo_catalog(&self, count: usize) -> Result<usize> {
        let dimension = self.config.vector.dimension;
        let now = now_millis();
        let operations: Vec<BulkOperation> = {
            let mut rng = rand::thread_rng();
            (0..count)
                .map(|i| {
                    let cluster = i % DEMO_CATEGORIES.len();
                    let product = ProductDocument {
                        product_id: format!("P{:06}", i),
                        product_name: format!("{} item {}", DEMO_CATEGORIES[cluster], i),
                        category: DEMO_CATEGORIES[cluster].to_string(),
                        price: rng.gen_range(5.0..500.0),
                        stock: Some(rng.gen_range(0..200)),
                        product_vector: Some(demo_vector(&mut rng, dimension, cluster)),
                        created_at: Some(now - i as i64 * 60_000),
                    };
                    BulkOperation {
                        id: product.product_id.clone(),
                        document: serde_json::to_value(&product).unwrap_or_default(),
                    }
                })
                .collect()
        };

        let response = self
            .documents
            .bulk_upsert(&self.config.indices.product, operations)
            .await?;
        let seeded = response.items.iter().filter(|item| item.error.is_none()).count();
        info!("🛍️  Seeded {} demo products into {}", seeded, self.config.indices.product);
        Ok(seeded)
    }
}

fn demo_vector(rng: &mut impl Rng, dim: usize, cluster: usize) -> Vec<f32> {
    let cluster_centers: [[f32; 8]; 6] = [
        [0.8, 0.2, -0.1, 0.5, 0.3, -0.2, 0.7, 0.1],
        [0.1, 0.9, 0.4, -0.3, 0.6, 0.2, -0.1, 0.8],
        [-0.2, 0.3, 0.8, 0.1, -0.4, 0.7, 0.2, 0.5],
        [0.6, -0.1, 0.2, 0.9, 0.1, -0.3, 0.5, 0.4],
        [0.3, 0.7, -0.2, 0.4, 0.8, 0.1, -0.1, 0.6],
        [-0.5, 0.1, 0.6, -0.2, 0.2, 0.9, -0.3, 0.3],
    ];

    let center = &cluster_centers[cluster % cluster_centers.len()];
    let vector: Vec<f32> = (0..dim)
        .map(|i| center.get(i).copied().unwrap_or(0.0) + rng.gen_range(-0.2..0.2))
        .collect();
    normalize(&vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_products_have_configured_dimension() {
        let mut config = Config::default();
        config.vector.dimension = 16;
        let services = Services::build(config).unwrap();

        assert_eq!(services.seed_demo_catalog(12).await.unwrap(), 12);
        assert_eq!(services.documents.count("product_index"), 12);

        let doc = services.documents.get("product_index", "P000003").await.unwrap().unwrap();
        let product: ProductDocument = serde_json::from_value(doc).unwrap();
        assert_eq!(product.product_vector.unwrap().len(), 16);
        assert_eq!(product.category, "beauty");
    }
}
