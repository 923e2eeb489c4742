//! Full-sync directive registry.
//!
//! A flag keyed by (branch, module or `*`) marks every sync response for
//! that scope with `fullSyncRequired` until it is cleared.

use dashmap::DashMap;
use pos_sync_engine::{clock::to_rfc3339, SharedClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Module id matching every module of a branch.
pub const WILDCARD: &str = "*";

/// A full-sync directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncFlag {
    pub id: String,
    pub branch_id: String,
    pub module_id: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub updated_at: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_by: Option<String>,
}

/// Request to raise or update a flag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRequest {
    pub branch_id: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn flag_key(branch_id: &str, module_id: &str) -> String {
    format!("{branch_id}::{module_id}")
}

fn normalize_module(module_id: Option<&str>) -> String {
    module_id
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(WILDCARD)
        .to_string()
}

/// Full-sync flags for every branch.
#[derive(Debug)]
pub struct FullSyncRegistry {
    flags: DashMap<String, FullSyncFlag>,
    clock: SharedClock,
}

impl FullSyncRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            flags: DashMap::new(),
            clock,
        }
    }

    /// Raise a flag. An existing flag for the scope keeps its id and merges
    /// the new meta into its own.
    pub fn upsert(&self, request: FlagRequest) -> FullSyncFlag {
        let module_id = normalize_module(request.module_id.as_deref());
        let updated_at = to_rfc3339(self.clock.now_millis());
        let mut entry = self
            .flags
            .entry(flag_key(&request.branch_id, &module_id))
            .or_insert_with(|| FullSyncFlag {
                id: format!("fsync-{}", uuid::Uuid::new_v4()),
                branch_id: request.branch_id.clone(),
                module_id: module_id.clone(),
                enabled: true,
                reason: None,
                requested_by: None,
                updated_at: updated_at.clone(),
                meta: Map::new(),
                cleared_by: None,
            });

        let flag = entry.value_mut();
        flag.enabled = true;
        flag.updated_at = updated_at;
        flag.cleared_by = None;
        if request.reason.is_some() {
            flag.reason = request.reason;
        }
        if request.requested_by.is_some() {
            flag.requested_by = request.requested_by;
        }
        flag.meta.extend(request.meta);

        tracing::info!(
            branch_id = %flag.branch_id,
            module_id = %flag.module_id,
            flag_id = %flag.id,
            "full-sync flag raised"
        );
        flag.clone()
    }

    /// Disable a flag, keeping it for the record.
    pub fn clear(
        &self,
        branch_id: &str,
        module_id: Option<&str>,
        cleared_by: Option<String>,
    ) -> Option<FullSyncFlag> {
        let module_id = normalize_module(module_id);
        let mut entry = self.flags.get_mut(&flag_key(branch_id, &module_id))?;
        let flag = entry.value_mut();
        flag.enabled = false;
        flag.cleared_by = cleared_by;
        flag.updated_at = to_rfc3339(self.clock.now_millis());
        tracing::info!(branch_id = %branch_id, module_id = %module_id, "full-sync flag cleared");
        Some(flag.clone())
    }

    /// Enabled flags that apply to a dataset.
    pub fn active(&self, branch_id: &str, module_id: &str) -> Vec<FullSyncFlag> {
        self.list(Some(branch_id), Some(module_id), false)
    }

    /// Flags filtered by branch and module (a wildcard flag matches every
    /// module), optionally including cleared ones.
    pub fn list(
        &self,
        branch_id: Option<&str>,
        module_id: Option<&str>,
        include_disabled: bool,
    ) -> Vec<FullSyncFlag> {
        let mut flags: Vec<FullSyncFlag> = self
            .flags
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|flag| include_disabled || flag.enabled)
            .filter(|flag| branch_id.map_or(true, |b| flag.branch_id == b))
            .filter(|flag| {
                module_id.map_or(true, |m| flag.module_id == m || flag.module_id == WILDCARD)
            })
            .collect();
        flags.sort_by(|a, b| (&a.branch_id, &a.module_id).cmp(&(&b.branch_id, &b.module_id)));
        flags
    }
}
