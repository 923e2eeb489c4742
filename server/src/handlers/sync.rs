//! HTTP sync handlers: snapshot reads, snapshot applies, deltas and guarded
//! saves.

use pos_sync_engine::{
    normalize_trans_id, ConcurrencyGuards, DeltaRequest, IncomingSnapshot, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::DurableStore;
use crate::error::Result;
use crate::sync::{Mutation, MutationAction, Submission, SyncService};

/// Body of `POST /api/sync/{branch}/{module}/save`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub table: String,
    pub record: Record,
    /// `module:save` unless given
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub concurrency_guards: ConcurrencyGuards,
    #[serde(default)]
    pub snapshot_marker: Option<String>,
    #[serde(default)]
    pub trans_id: Option<Value>,
    #[serde(default)]
    pub mutation_id: Option<String>,
}

/// Response to a save or snapshot apply.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    pub ok: bool,
    pub duplicate_trans: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acked_mutation_id: Option<String>,
    pub result: Value,
}

/// Current sync payload of a dataset.
pub async fn handle_snapshot<D: DurableStore>(
    sync: &SyncService<D>,
    branch_id: &str,
    module_id: &str,
) -> Result<Value> {
    sync.snapshot(branch_id, module_id).await
}

/// Delta for the client's table cursors, as JSON.
pub async fn handle_delta<D: DurableStore>(
    sync: &SyncService<D>,
    branch_id: &str,
    module_id: &str,
    request: DeltaRequest,
) -> Result<Value> {
    let reply = sync.delta(branch_id, module_id, &request).await?;
    serde_json::to_value(reply).map_err(|e| crate::error::AppError::Internal(e.to_string()))
}

/// Validate and apply a full snapshot. The body is either the snapshot or
/// `{snapshot, transId?, mutationId?}`.
pub async fn handle_apply_snapshot<D: DurableStore>(
    sync: &SyncService<D>,
    branch_id: &str,
    module_id: &str,
    body: Value,
) -> Result<WriteResponse> {
    let incoming = IncomingSnapshot::from_value(&body)?;
    let trans_id = body.get("transId").and_then(normalize_trans_id);
    let mutation_id = body.get("mutationId").and_then(normalize_trans_id);
    write(
        sync,
        branch_id,
        module_id,
        Submission::Snapshot(incoming),
        trans_id,
        mutation_id,
    )
    .await
}

/// Guarded single-row write.
pub async fn handle_save<D: DurableStore>(
    sync: &SyncService<D>,
    branch_id: &str,
    module_id: &str,
    request: SaveRequest,
) -> Result<WriteResponse> {
    let action = match request.action.as_deref() {
        Some(raw) => MutationAction::parse(raw).ok_or_else(|| {
            crate::error::AppError::BadRequest(format!("unsupported action {raw}"))
        })?,
        None => MutationAction::Save,
    };
    let mutation = Mutation {
        action,
        table: request.table,
        record: request.record,
        guards: request.concurrency_guards,
        snapshot_marker: request.snapshot_marker,
    };
    let trans_id = request.trans_id.as_ref().and_then(normalize_trans_id);
    write(
        sync,
        branch_id,
        module_id,
        Submission::Mutation(mutation),
        trans_id,
        request.mutation_id,
    )
    .await
}

async fn write<D: DurableStore>(
    sync: &SyncService<D>,
    branch_id: &str,
    module_id: &str,
    submission: Submission,
    trans_id: Option<String>,
    mutation_id: Option<String>,
) -> Result<WriteResponse> {
    let accepted = sync
        .submit(
            branch_id,
            module_id,
            submission,
            trans_id.as_deref(),
            mutation_id.as_deref(),
        )
        .await?;
    Ok(WriteResponse {
        ok: true,
        duplicate_trans: accepted.duplicate,
        acked_mutation_id: accepted.acked_mutation_id,
        result: accepted.result,
    })
}
