//! Sync endpoint routes.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use pos_sync_engine::DeltaRequest;
use serde_json::Value;

use crate::error::Result;
use crate::handlers::{
    handle_apply_snapshot, handle_delta, handle_save, handle_snapshot, SaveRequest, WriteResponse,
};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/sync/{branch}/{module}",
            get(snapshot_handler).post(apply_snapshot_handler),
        )
        .route("/api/sync/{branch}/{module}/delta", post(delta_handler))
        .route("/api/sync/{branch}/{module}/save", post(save_handler))
}

/// GET /api/sync/{branch}/{module} - Full sync payload.
async fn snapshot_handler(
    State(state): State<AppState>,
    Path((branch, module)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let payload = handle_snapshot(&state.sync, &branch, &module).await?;
    Ok(Json(payload))
}

/// POST /api/sync/{branch}/{module} - Apply a full snapshot.
async fn apply_snapshot_handler(
    State(state): State<AppState>,
    Path((branch, module)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<WriteResponse>> {
    let response = handle_apply_snapshot(&state.sync, &branch, &module, body).await?;
    Ok(Json(response))
}

/// POST /api/sync/{branch}/{module}/delta - Rows after the client's cursors.
async fn delta_handler(
    State(state): State<AppState>,
    Path((branch, module)): Path<(String, String)>,
    Json(request): Json<DeltaRequest>,
) -> Result<Json<Value>> {
    let response = handle_delta(&state.sync, &branch, &module, request).await?;
    Ok(Json(response))
}

/// POST /api/sync/{branch}/{module}/save - Guarded single-row write.
async fn save_handler(
    State(state): State<AppState>,
    Path((branch, module)): Path<(String, String)>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<WriteResponse>> {
    let response = handle_save(&state.sync, &branch, &module, request).await?;
    Ok(Json(response))
}
