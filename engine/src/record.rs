//! Record representation and identity helpers.
//!
//! Records are free-form field maps. Their identity comes from the owning
//! table's primary-key fields; a [`RecordRef`] is the portable form of that
//! identity handed to clients as a cursor.

use crate::{RecordKey, TableName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A record: field name to JSON value.
pub type Record = Map<String, Value>;

/// Rows grouped by table, ordered by table name.
pub type TableRows = BTreeMap<TableName, Vec<Record>>;

/// Separator used when joining composite primary-key parts.
pub const KEY_SEPARATOR: &str = "::";

/// Identity fields consulted for cursors besides the declared primary key.
pub const IDENTITY_FIELDS: [&str; 3] = ["id", "uuid", "uid"];

/// Render a scalar as a key part. Null, empty strings and composite values
/// are not usable as identity.
pub fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Interpret a JSON value as a record.
pub fn as_record(value: &Value) -> Option<&Record> {
    value.as_object()
}

/// Convert a JSON value into an owned record.
pub fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Resolved primary key of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// Joined key (`a::b` for composite keys)
    pub key: RecordKey,
    /// Individual key parts by field name
    pub parts: BTreeMap<String, String>,
}

/// Portable reference to a record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef {
    pub table: TableName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<RecordKey>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub primary_key: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Value>,
}

impl RecordRef {
    /// Build a reference from a record and its resolved key.
    pub fn new(table: impl Into<TableName>, record: &Record, key: Option<ResolvedKey>) -> Self {
        let pick = |field: &str| {
            record
                .get(field)
                .filter(|v| key_part(v).is_some())
                .cloned()
        };
        let (key, primary_key) = match key {
            Some(resolved) => (Some(resolved.key), resolved.parts),
            None => (None, BTreeMap::new()),
        };
        Self {
            table: table.into(),
            key,
            primary_key,
            id: pick("id"),
            uuid: pick("uuid"),
            uid: pick("uid"),
        }
    }

    /// Whether the reference carries any identity at all.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
            && self.primary_key.is_empty()
            && self.id.is_none()
            && self.uuid.is_none()
            && self.uid.is_none()
    }

    /// Every string form this reference can be matched by.
    pub fn candidates(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(key) = &self.key {
            out.push(key.clone());
        }
        for value in [&self.id, &self.uuid, &self.uid].into_iter().flatten() {
            if let Some(part) = key_part(value) {
                out.push(part);
            }
        }
        match self.primary_key.len() {
            0 => {}
            1 => out.extend(self.primary_key.values().cloned()),
            _ => out.push(
                self.primary_key
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(KEY_SEPARATOR),
            ),
        }
        out.sort();
        out.dedup();
        out
    }

    /// Preferred single token for this reference.
    pub fn token(&self) -> Option<String> {
        if let Some(key) = &self.key {
            return Some(key.clone());
        }
        [&self.id, &self.uuid, &self.uid]
            .into_iter()
            .flatten()
            .find_map(key_part)
    }
}
