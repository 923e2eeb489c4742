//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub server_id: String,
    pub connections: usize,
    /// Branches with at least one bound connection
    pub branches: usize,
    pub datasets: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        server_id: state.config.server_id.clone(),
        connections: state.conn_manager.connection_count(),
        branches: state.conn_manager.branch_count(),
        datasets: state.sync.registry().len(),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "POS Sync Server"
}
