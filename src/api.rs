use axum::extract::{Query, State};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use crate::change::TopologyChange;
use crate::constants::PROTOCOL_VERSION;
use crate::coordinator::{DiscoveryCoordinator, DiscoveryStats};
use crate::routing_table::TopologySnapshot;

const DEFAULT_CHANGE_LIMIT: usize = 50;
const MAX_CHANGE_LIMIT: usize = 1000;

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub stats: DiscoveryStats,
    pub timestamp: String,
}

#[derive(Serialize, Deserialize)]
pub struct ChangesResponse {
    pub count: usize,
    pub changes: Vec<TopologyChange>,
}

#[derive(Deserialize)]
pub struct ChangesQuery {
    pub limit: Option<usize>,
}

pub async fn status_handler(
    State(coordinator): State<Arc<DiscoveryCoordinator>>
) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: PROTOCOL_VERSION.to_string(),
        stats: coordinator.get_stats().await,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn topology_handler(
    State(coordinator): State<Arc<DiscoveryCoordinator>>
) -> Json<TopologySnapshot> {
    Json(coordinator.get_topology_snapshot().await)
}

/// The most recent `limit` changes, oldest first.
pub async fn changes_handler(
    State(coordinator): State<Arc<DiscoveryCoordinator>>,
    Query(query): Query<ChangesQuery>,
) -> Json<ChangesResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_CHANGE_LIMIT).min(MAX_CHANGE_LIMIT);
    let changes = coordinator.recent_changes(limit).await;
    Json(ChangesResponse { count: changes.len(), changes })
}

pub fn router(coordinator: Arc<DiscoveryCoordinator>) -> Router {
    Router::new()
        .route("/v1/status", get(status_handler))
        .route("/v1/topology", get(topology_handler))
        .route("/v1/changes", get(changes_handler))
        .with_state(coordinator)
}
