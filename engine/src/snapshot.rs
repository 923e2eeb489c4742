//! Module snapshots and insert-only validation.
//!
//! A snapshot is the full `{version, tables, meta}` view of one dataset.
//! Snapshots pushed by clients are validated in full before any table is
//! touched: they may only add or overwrite rows, never lose a table, never
//! carry keyless or duplicate rows, and never move the version backwards.

use crate::{
    error::Result,
    record::{Record, TableRows},
    store::{ModuleMeta, ModuleStore},
    BranchId, Error, ModuleId, RecordKey, TableName, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// A point-in-time copy of a module dataset.
///
/// Uses BTreeMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSnapshot {
    pub branch_id: BranchId,
    pub module_id: ModuleId,
    /// Store-level version at capture time
    pub version: Version,
    pub tables: TableRows,
    pub meta: ModuleMeta,
}

impl ModuleSnapshot {
    /// Rows of one table, empty if absent.
    pub fn table(&self, name: &str) -> &[Record] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Count total rows across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Row counts per table, for logging.
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary::from_tables(self.version, &self.tables)
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}

/// Lightweight description of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub version: Version,
    pub table_counts: BTreeMap<TableName, usize>,
    pub total: usize,
}

impl SnapshotSummary {
    pub fn from_tables(version: Version, tables: &TableRows) -> Self {
        let table_counts: BTreeMap<_, _> = tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len()))
            .collect();
        let total = table_counts.values().sum();
        Self {
            version,
            table_counts,
            total,
        }
    }
}

/// The rule an incoming snapshot broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InsertOnlyViolation {
    #[error("snapshot version {incoming_version} is older than current version {current_version}")]
    VersionRegression {
        current_version: Version,
        incoming_version: Version,
    },

    #[error("snapshot omits table \"{table}\"")]
    MissingTable { table: TableName },

    #[error("snapshot table \"{table}\" is not a list of records")]
    InvalidTableFormat { table: TableName },

    #[error("row {index} of \"{table}\" has no primary key")]
    MissingPrimaryKey { table: TableName, index: usize },

    #[error("duplicate primary key {key} in \"{table}\"")]
    DuplicatePrimaryKey { table: TableName, key: RecordKey },
}

impl InsertOnlyViolation {
    /// Machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            InsertOnlyViolation::VersionRegression { .. } => "version-regression",
            InsertOnlyViolation::MissingTable { .. } => "missing-table",
            InsertOnlyViolation::InvalidTableFormat { .. } => "invalid-table-format",
            InsertOnlyViolation::MissingPrimaryKey { .. } => "missing-primary-key",
            InsertOnlyViolation::DuplicatePrimaryKey { .. } => "duplicate-primary-key",
        }
    }
}

/// A snapshot as received from a client, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingSnapshot {
    pub version: Option<Version>,
    pub tables: Map<String, Value>,
    pub meta: Map<String, Value>,
}

impl IncomingSnapshot {
    /// Read a snapshot payload. Accepts either the snapshot itself or an
    /// object wrapping it under `snapshot`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidSnapshot("snapshot must be an object".into()))?;
        let object = match object.get("snapshot").and_then(Value::as_object) {
            Some(inner) => inner,
            None => object,
        };

        let tables = match object.get("tables") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(tables)) => tables.clone(),
            Some(_) => return Err(Error::InvalidSnapshot("tables must be an object".into())),
        };
        let meta = object
            .get("meta")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            version: crate::version::normalize_version(object.get("version")),
            tables,
            meta,
        })
    }
}

/// Check an incoming snapshot against the live store without touching it.
///
/// On success returns the typed rows of every module table.
pub fn validate_insert_only(
    store: &ModuleStore,
    incoming: &IncomingSnapshot,
) -> std::result::Result<TableRows, InsertOnlyViolation> {
    if let Some(incoming_version) = incoming.version {
        if incoming_version < store.version() {
            return Err(InsertOnlyViolation::VersionRegression {
                current_version: store.version(),
                incoming_version,
            });
        }
    }

    let mut validated = TableRows::new();
    for table in store.table_names() {
        let rows = match incoming.tables.get(table) {
            None => {
                return Err(InsertOnlyViolation::MissingTable {
                    table: table.clone(),
                })
            }
            Some(Value::Array(rows)) => rows,
            Some(_) => {
                return Err(InsertOnlyViolation::InvalidTableFormat {
                    table: table.clone(),
                })
            }
        };

        let schema = store
            .table_schema(table)
            .map_err(|_| InsertOnlyViolation::MissingTable {
                table: table.clone(),
            })?;
        let mut seen = HashSet::with_capacity(rows.len());
        let mut typed = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let record = row
                .as_object()
                .ok_or_else(|| InsertOnlyViolation::InvalidTableFormat {
                    table: table.clone(),
                })?;
            let key = schema
                .resolve_key(record)
                .ok_or_else(|| InsertOnlyViolation::MissingPrimaryKey {
                    table: table.clone(),
                    index,
                })?;
            if !seen.insert(key.key.clone()) {
                return Err(InsertOnlyViolation::DuplicatePrimaryKey {
                    table: table.clone(),
                    key: key.key,
                });
            }
            typed.push(record.clone());
        }
        validated.insert(table.clone(), typed);
    }

    Ok(validated)
}

impl ModuleStore {
    /// Validate a client snapshot and replace every table with its rows.
    /// The store is untouched when validation fails.
    pub fn apply_snapshot(&mut self, incoming: &IncomingSnapshot) -> Result<Version> {
        let tables = validate_insert_only(self, incoming)?;
        let summary = SnapshotSummary::from_tables(incoming.version.unwrap_or(0), &tables);
        tracing::debug!(
            branch_id = %self.branch_id(),
            module_id = %self.module_id(),
            incoming_version = summary.version,
            rows = summary.total,
            "applying client snapshot"
        );
        for (key, value) in &incoming.meta {
            if matches!(key.as_str(), "snapshotMarker" | "businessDate" | "businessDay") {
                self.meta_mut().extra.insert(key.clone(), value.clone());
            }
        }
        self.replace_tables_from_snapshot(&tables, incoming.version)
    }
}
