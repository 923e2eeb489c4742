//! Cursors and the insert-only delta protocol.
//!
//! A client remembers, per table, the last record it has seen. On a delta
//! request the server scans the table backwards for that record and returns
//! only the rows after it. A cursor that matches nothing in a non-empty
//! table means the client's view is no longer valid and it must fetch a full
//! snapshot.

use crate::{
    clock::business_day,
    error::Result,
    record::{key_part, Record, RecordRef, IDENTITY_FIELDS, KEY_SEPARATOR},
    store::{ModuleMeta, ModuleStore},
    TableName, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Meta keys that may carry an explicit snapshot marker, in priority order.
const MARKER_KEYS: [&str; 7] = [
    "snapshotMarker",
    "businessDate",
    "business_date",
    "businessDay",
    "business_day",
    "currentDay",
    "day",
];

/// All string forms a cursor value can match.
///
/// Accepts a bare token (`"o1"`, `42`) or an object with any of `key`,
/// `id`, `uuid`, `uid` and `primaryKey`.
pub fn cursor_candidates(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    match value {
        Value::Object(map) => {
            for field in ["key", "value"].into_iter().chain(IDENTITY_FIELDS) {
                if let Some(part) = map.get(field).and_then(key_part) {
                    out.insert(part);
                }
            }
            match map.get("primaryKey") {
                Some(Value::Object(parts)) => {
                    let joined: Vec<String> = parts.values().filter_map(key_part).collect();
                    if joined.len() == parts.len() && !joined.is_empty() {
                        out.insert(joined.join(KEY_SEPARATOR));
                    }
                }
                Some(other) => {
                    if let Some(part) = key_part(other) {
                        out.insert(part);
                    }
                }
                None => {}
            }
        }
        other => {
            if let Some(part) = key_part(other) {
                out.insert(part);
            }
        }
    }
    out
}

pub(crate) fn reference_matches(reference: &RecordRef, candidates: &BTreeSet<String>) -> bool {
    reference
        .candidates()
        .iter()
        .any(|candidate| candidates.contains(candidate))
}

/// Locate a record by cursor, newest first.
pub fn find_by_cursor<'a>(
    store: &'a ModuleStore,
    table: &str,
    cursor: &Value,
) -> Result<Option<&'a Record>> {
    let candidates = cursor_candidates(cursor);
    if candidates.is_empty() {
        return Ok(None);
    }
    let schema = store.table_schema(table)?;
    Ok(store.rows(table)?.iter().rev().find(|row| {
        let reference = RecordRef::new(table, row, schema.resolve_key(row));
        reference_matches(&reference, &candidates)
    }))
}

/// Result of [`compute_insert_only_delta`] for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDelta {
    /// Rows after the cursor
    pub rows: Vec<Record>,
    /// Rows currently in the table
    pub total: usize,
    /// The cursor was found
    pub cursor_matched: bool,
    /// A cursor was supplied but nothing matched in a non-empty table
    pub requires_full_sync: bool,
    /// Reference to the newest row
    pub last_cursor: Option<RecordRef>,
}

/// Rows of `table` newer than `cursor`.
pub fn compute_insert_only_delta(
    store: &ModuleStore,
    table: &str,
    cursor: Option<&Value>,
) -> Result<TableDelta> {
    let schema = store.table_schema(table)?;
    let rows = store.rows(table)?;
    let reference = |row: &Record| RecordRef::new(table, row, schema.resolve_key(row));
    let last_cursor = rows.last().map(reference);

    let candidates = cursor.map(cursor_candidates).unwrap_or_default();
    if candidates.is_empty() {
        return Ok(TableDelta {
            rows: rows.to_vec(),
            total: rows.len(),
            cursor_matched: false,
            requires_full_sync: false,
            last_cursor,
        });
    }

    let matched = rows
        .iter()
        .rposition(|row| reference_matches(&reference(row), &candidates));

    Ok(match matched {
        Some(idx) => TableDelta {
            rows: rows[idx + 1..].to_vec(),
            total: rows.len(),
            cursor_matched: true,
            requires_full_sync: false,
            last_cursor,
        },
        // A stale cursor gets the whole table with the resync verdict.
        None => TableDelta {
            rows: rows.to_vec(),
            total: rows.len(),
            cursor_matched: false,
            requires_full_sync: !rows.is_empty(),
            last_cursor,
        },
    })
}

/// The server's business-day marker for a dataset.
pub fn server_snapshot_marker(meta: &ModuleMeta) -> Option<String> {
    MARKER_KEYS
        .iter()
        .find_map(|key| meta.extra.get(*key).and_then(key_part))
        .or_else(|| meta.last_updated_at.map(business_day))
}

/// Client request for table deltas.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRequest {
    /// Last seen cursor per table
    #[serde(default, alias = "lastTableIds", alias = "lastIds")]
    pub table_cursors: Map<String, Value>,
    /// Tables to include, all module tables when absent
    #[serde(default)]
    pub tables: Option<Vec<TableName>>,
    #[serde(default)]
    pub snapshot_marker: Option<String>,
    #[serde(default)]
    pub version: Option<Value>,
}

/// Per-table counters in a delta response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub total: usize,
    pub returned: usize,
    pub cursor_matched: bool,
}

/// Delta answer for a whole module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub version: Version,
    pub snapshot_marker: Option<String>,
    pub requires_full_sync: bool,
    pub cursor_misses: Vec<TableName>,
    pub last_table_ids: BTreeMap<TableName, String>,
    pub last_table_refs: BTreeMap<TableName, RecordRef>,
    pub deltas: BTreeMap<TableName, Vec<Record>>,
    pub stats: BTreeMap<TableName, TableStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_snapshot_marker: Option<String>,
}

/// Answer a delta request against the live store.
pub fn compute_delta(store: &ModuleStore, request: &DeltaRequest) -> Result<DeltaResponse> {
    let server_marker = server_snapshot_marker(store.meta());
    let client_marker = request
        .snapshot_marker
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let tables: Vec<TableName> = match &request.tables {
        Some(requested) => requested
            .iter()
            .filter(|name| store.has_table(name))
            .cloned()
            .collect(),
        None => store.table_names().to_vec(),
    };

    let mut response = DeltaResponse {
        version: store.version(),
        snapshot_marker: server_marker.clone(),
        requires_full_sync: tables.is_empty(),
        cursor_misses: Vec::new(),
        last_table_ids: BTreeMap::new(),
        last_table_refs: BTreeMap::new(),
        deltas: BTreeMap::new(),
        stats: BTreeMap::new(),
        client_version: crate::version::normalize_version(request.version.as_ref()),
        client_snapshot_marker: client_marker.clone(),
    };

    if let (Some(client), Some(server)) = (&client_marker, &server_marker) {
        if client != server {
            response.requires_full_sync = true;
        }
    }
    if let (Some(client), Some(closed)) = (&client_marker, &store.meta().last_closed_date) {
        if client.as_str() < closed.as_str() {
            response.requires_full_sync = true;
        }
    }

    for table in tables {
        let delta = compute_insert_only_delta(store, &table, request.table_cursors.get(&table))?;
        if delta.requires_full_sync {
            response.requires_full_sync = true;
            response.cursor_misses.push(table.clone());
        }
        if let Some(last) = delta.last_cursor {
            if let Some(token) = last.token() {
                response.last_table_ids.insert(table.clone(), token);
            }
            response.last_table_refs.insert(table.clone(), last);
        }
        response.stats.insert(
            table.clone(),
            TableStats {
                total: delta.total,
                returned: delta.rows.len(),
                cursor_matched: delta.cursor_matched,
            },
        );
        response.deltas.insert(table, delta.rows);
    }

    Ok(response)
}
