//! Data shared between ingestion, preference and retrieval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    View,
    Click,
    Search,
    AddToCart,
    Purchase,
    Wishlist,
    #[serde(other)]
    Unknown,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::View => "VIEW",
            ActionType::Click => "CLICK",
            ActionType::Search => "SEARCH",
            ActionType::AddToCart => "ADD_TO_CART",
            ActionType::Purchase => "PURCHASE",
            ActionType::Wishlist => "WISHLIST",
            ActionType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable fact produced upstream. `trace_id` doubles as the document id
/// in the behavior index, so redelivery overwrites instead of duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorEvent {
    pub trace_id: String,
    pub user_id: String,
    pub product_id: String,
    pub category: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Epoch millis.
    pub timestamp: i64,
}

impl BehaviorEvent {
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "traceId": self.trace_id,
            "userId": self.user_id,
            "productId": self.product_id,
            "category": self.category,
            "actionType": self.action_type.as_str(),
            "metadata": self.metadata,
            "timestamp": self.timestamp,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProductDocument {
    pub product_id: String,
    pub product_name: String,
    pub category: String,
    pub price: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_vector: Option<Vec<f32>>,
    /// Epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// Value stored in the fast store under `user:preference:<userId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferenceData {
    pub vector: Vec<f32>,
    pub action_count: u64,
    /// Epoch millis.
    pub updated_at: i64,
}

/// Backup copy kept in the durable preference index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferenceDocument {
    pub user_id: String,
    pub preference_vector: Vec<f32>,
    pub action_count: u64,
    pub last_updated: i64,
}

impl UserPreferenceDocument {
    pub fn new(user_id: &str, data: &UserPreferenceData) -> Self {
        Self {
            user_id: user_id.to_string(),
            preference_vector: data.vector.clone(),
            action_count: data.action_count,
            last_updated: data.updated_at,
        }
    }

    pub fn into_data(self) -> UserPreferenceData {
        UserPreferenceData {
            vector: self.preference_vector,
            action_count: self.action_count,
            updated_at: self.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecommendation {
    pub product_id: String,
    pub product_name: String,
    pub category: String,
    pub price: f32,
    pub score: f64,
}

impl ProductRecommendation {
    pub fn from_document(id: &str, doc: ProductDocument, score: f64) -> Self {
        let product_id = if doc.product_id.is_empty() {
            id.to_string()
        } else {
            doc.product_id
        };
        Self {
            product_id,
            product_name: doc.product_name,
            category: doc.category,
            price: doc.price,
            score,
        }
    }
}

/// How a recommendation list was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "vector-search")]
    VectorSearch,
    #[serde(rename = "popularity-global")]
    PopularityGlobal,
    #[serde(rename = "popularity-category")]
    PopularityCategory,
    #[serde(rename = "trending-global")]
    TrendingGlobal,
    #[serde(rename = "trending-category")]
    TrendingCategory,
    #[serde(rename = "newest-fallback")]
    NewestFallback,
    #[serde(rename = "error-fallback")]
    ErrorFallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::VectorSearch => "vector-search",
            Strategy::PopularityGlobal => "popularity-global",
            Strategy::PopularityCategory => "popularity-category",
            Strategy::TrendingGlobal => "trending-global",
            Strategy::TrendingCategory => "trending-category",
            Strategy::NewestFallback => "newest-fallback",
            Strategy::ErrorFallback => "error-fallback",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResult {
    pub user_id: String,
    pub recommendations: Vec<ProductRecommendation>,
    pub strategy: Strategy,
    pub latency_ms: u64,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
