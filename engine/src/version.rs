//! Optimistic-concurrency version resolution for versioned tables.

use crate::{RecordKey, TableName, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Field holding a record's version.
pub const VERSION_FIELD: &str = "version";

/// Why an update was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    /// The patch did not say which version it expects to produce.
    MissingVersion,
    /// The patch was computed against an older version of the record.
    StaleVersion,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::MissingVersion => "missing-version",
            ConflictReason::StaleVersion => "stale-version",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused update on a versioned record.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("version conflict on {table}/{key}: {reason} (expected {expected_version:?}, current {current_version})")]
pub struct VersionConflict {
    pub table: TableName,
    pub key: RecordKey,
    pub expected_version: Option<Version>,
    pub current_version: Version,
    pub reason: ConflictReason,
}

impl VersionConflict {
    /// Message suitable for showing to a cashier.
    pub fn user_message(&self) -> &'static str {
        match self.reason {
            ConflictReason::MissingVersion => {
                "The update did not include a version. Reload the record and try again."
            }
            ConflictReason::StaleVersion => {
                "Another device already changed this record. Reload it before saving again."
            }
        }
    }
}

/// Read a positive integer version from a JSON value. Accepts integers,
/// integral floats and numeric strings.
pub fn normalize_version(value: Option<&Value>) -> Option<Version> {
    let version = match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f > 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (version > 0).then_some(version)
}

/// Compute the version an accepted update produces.
///
/// `current` is the stored version (legacy rows without one count as 1),
/// `expected` is the version the caller intends to write.
pub fn resolve_next_version(
    table: &str,
    key: &str,
    current: Option<Version>,
    expected: Option<Version>,
) -> Result<Version, VersionConflict> {
    let current = current.unwrap_or(1).max(1);
    let conflict = |reason| VersionConflict {
        table: table.to_string(),
        key: key.to_string(),
        expected_version: expected,
        current_version: current,
        reason,
    };

    let Some(expected) = expected else {
        return Err(conflict(ConflictReason::MissingVersion));
    };
    if expected == 1 && current == 1 {
        return Ok(2);
    }
    if expected != current + 1 {
        return Err(conflict(ConflictReason::StaleVersion));
    }
    Ok(current + 1)
}
