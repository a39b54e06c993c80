//! HTTP surface: recommendation queries and an event intake that feeds the
//! in-process stream.

use crate::error::{Error, Result};
use crate::model::{now_millis, ActionType, BehaviorEvent, RecommendationResult};
use crate::recommend::RecommendationService;
use crate::stream::InMemoryStream;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub recommendations: Arc<RecommendationService>,
    pub stream: Arc<InMemoryStream>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationParams {
    pub limit: Option<usize>,
    pub category: Option<String>,
    pub exclude_viewed: Option<bool>,
}

impl RecommendationParams {
    fn category(&self) -> Option<&str> {
        self.category.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// Incoming behavior event. `traceId` and `timestamp` are filled in when the
/// producer leaves them out.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub trace_id: Option<String>,
    pub user_id: String,
    pub product_id: String,
    #[serde(default)]
    pub category: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub timestamp: Option<i64>,
}

impl EventRequest {
    fn into_event(self) -> Result<BehaviorEvent> {
        if self.user_id.trim().is_empty() || self.product_id.trim().is_empty() {
            return Err(Error::InvalidRequest("userId and productId are required".to_string()));
        }
        Ok(BehaviorEvent {
            trace_id: self
                .trace_id
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: self.user_id,
            product_id: self.product_id,
            category: self.category,
            action_type: self.action_type,
            metadata: self.metadata,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAccepted {
    pub trace_id: String,
    pub partition: u32,
    pub offset: u64,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/recommendations/popular", get(handle_popular))
        .route("/api/v1/recommendations/:user_id", get(handle_recommendations))
        .route("/api/v1/events", post(handle_event))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn handle_popular(
    State(state): State<AppState>,
    Query(params): Query<RecommendationParams>,
) -> Json<RecommendationResult> {
    debug!("Popular products request: limit={:?}, category={:?}", params.limit, params.category);
    Json(state.recommendations.popular(params.limit, params.category()).await)
}

async fn handle_recommendations(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    Query(params): Query<RecommendationParams>,
) -> Json<RecommendationResult> {
    let result = state
        .recommendations
        .recommend(
            &user_id,
            params.limit,
            params.category(),
            params.exclude_viewed.unwrap_or(true),
        )
        .await;
    Json(result)
}

async fn handle_event(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> Result<Json<EventAccepted>> {
    let event = request.into_event()?;
    let trace_id = event.trace_id.clone();
    let (partition, offset) = state.stream.produce(event);
    debug!("Accepted event {} at {}/{}", trace_id, partition, offset);
    Ok(Json(EventAccepted {
        trace_id,
        partition,
        offset,
    }))
}
