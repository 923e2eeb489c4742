//! Management routes: full-sync flags, purge, purge history and reset.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::sync::{FlagRequest, PurgeRequest, ResetRequest, RestoreRequest};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagQuery {
    pub branch_id: Option<String>,
    pub module_id: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearFlagRequest {
    pub branch_id: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub cleared_by: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/manage/full-sync",
            get(list_flags).post(set_flag).delete(clear_flag),
        )
        .route("/api/manage/purge", post(purge))
        .route(
            "/api/manage/purge-history/{branch}/{module}",
            get(purge_history),
        )
        .route("/api/manage/purge-history/restore", post(restore_purge))
        .route("/api/manage/reset", post(reset))
}

async fn list_flags(State(state): State<AppState>, Query(query): Query<FlagQuery>) -> Json<Value> {
    let flags = state.sync.list_full_sync(
        query.branch_id.as_deref(),
        query.module_id.as_deref(),
        query.include_disabled,
    );
    Json(json!({ "flags": flags }))
}

async fn set_flag(
    State(state): State<AppState>,
    Json(request): Json<FlagRequest>,
) -> Result<Json<Value>> {
    let flag = state.sync.set_full_sync(request)?;
    Ok(Json(json!({ "flag": flag })))
}

async fn clear_flag(
    State(state): State<AppState>,
    Json(request): Json<ClearFlagRequest>,
) -> Result<Json<Value>> {
    let flag = state.sync.clear_full_sync(
        &request.branch_id,
        request.module_id.as_deref(),
        request.cleared_by,
    )?;
    Ok(Json(json!({ "flag": flag })))
}

async fn purge(
    State(state): State<AppState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Json<Value>> {
    let report = state.sync.purge(request).await?;
    Ok(Json(json!(report)))
}

async fn purge_history(
    State(state): State<AppState>,
    Path((branch, module)): Path<(String, String)>,
) -> Json<Value> {
    let entries = state.sync.purge_history(&branch, &module);
    Json(json!({ "branchId": branch, "moduleId": module, "entries": entries }))
}

async fn restore_purge(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<Value>> {
    Ok(Json(state.sync.restore_purge(request).await?))
}

async fn reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<Value>> {
    Ok(Json(state.sync.reset(request).await?))
}
