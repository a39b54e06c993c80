//! Service configuration.
//!
//! Every section falls back to its defaults, so an empty TOML file (or no
//! file at all) yields a working single-process setup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub vector: VectorConfig,
    pub indices: IndexNames,
    pub consumer: ConsumerConfig,
    pub preference: PreferenceConfig,
    pub recommendation: RecommendationConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub log_level: String,
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Must match the embedding model used by the product catalog.
    pub dimension: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { dimension: 384 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexNames {
    pub product: String,
    pub behavior: String,
    pub preference: String,
}

impl Default for IndexNames {
    fn default() -> Self {
        Self {
            product: "product_index".to_string(),
            behavior: "user_behavior_index".to_string(),
            preference: "user_preference_index".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub topic: String,
    pub dlq_topic: String,
    pub partitions: u32,
    pub bulk_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub dlq_file_max_size_bytes: u64,
    pub dlq_logs_dir: String,
    pub poll_interval_ms: u64,
    pub failed_batch_pause_ms: u64,
    pub preference_update_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "user.action.v1".to_string(),
            dlq_topic: "user.action.v1.dlq".to_string(),
            partitions: 6,
            bulk_size: 500,
            concurrency: 3,
            max_retries: 3,
            retry_delay_ms: 1000,
            dlq_file_max_size_bytes: 10 * 1024 * 1024,
            dlq_logs_dir: "logs".to_string(),
            poll_interval_ms: 100,
            failed_batch_pause_ms: 1000,
            preference_update_timeout_ms: 5000,
        }
    }
}

impl ConsumerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn failed_batch_pause(&self) -> Duration {
        Duration::from_millis(self.failed_batch_pause_ms)
    }

    pub fn preference_update_timeout(&self) -> Duration {
        Duration::from_millis(self.preference_update_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceConfig {
    pub ttl_secs: u64,
    /// Fast-store reads slower than this are treated as a miss.
    pub read_timeout_ms: u64,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            read_timeout_ms: 500,
        }
    }
}

impl PreferenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub num_candidates_multiplier: usize,
    pub recent_viewed_limit: usize,
    pub behavior_window_days: i64,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            num_candidates_multiplier: 10,
            recent_viewed_limit: 100,
            behavior_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub popular_ttl_secs: u64,
    pub global_cache_size: usize,
    pub category_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            popular_ttl_secs: 600,
            global_cache_size: 100,
            category_cache_size: 50,
        }
    }
}

impl CacheConfig {
    pub fn popular_ttl(&self) -> Duration {
        Duration::from_secs(self.popular_ttl_secs)
    }
}

impl Config {
    /// Load from a TOML file, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 14] = [
            ("vector.dimension", self.vector.dimension as u64),
            ("consumer.partitions", self.consumer.partitions as u64),
            ("consumer.bulk_size", self.consumer.bulk_size as u64),
            ("consumer.concurrency", self.consumer.concurrency as u64),
            ("consumer.max_retries", self.consumer.max_retries as u64),
            ("consumer.retry_delay_ms", self.consumer.retry_delay_ms),
            ("consumer.dlq_file_max_size_bytes", self.consumer.dlq_file_max_size_bytes),
            ("preference.ttl_secs", self.preference.ttl_secs),
            ("preference.read_timeout_ms", self.preference.read_timeout_ms),
            ("recommendation.max_limit", self.recommendation.max_limit as u64),
            (
                "recommendation.num_candidates_multiplier",
                self.recommendation.num_candidates_multiplier as u64,
            ),
            ("cache.popular_ttl_secs", self.cache.popular_ttl_secs),
            ("cache.global_cache_size", self.cache.global_cache_size as u64),
            ("cache.category_cache_size", self.cache.category_cache_size as u64),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }

        if self.consumer.topic.trim().is_empty() || self.consumer.dlq_topic.trim().is_empty() {
            return Err(Error::Config("topic names must not be blank".to_string()));
        }
        if self.consumer.dlq_logs_dir.trim().is_empty() {
            return Err(Error::Config("consumer.dlq_logs_dir must not be blank".to_string()));
        }
        if self.recommendation.behavior_window_days <= 0 {
            return Err(Error::Config(
                "recommendation.behavior_window_days must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
