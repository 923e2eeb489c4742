//! Concurrency guards for direct saves.
//!
//! A caller may attach guards to a save describing what it believes about
//! the stored record. Guards are checked before the store is touched; the
//! first failing guard produces a [`GuardConflict`].

use crate::{
    clock::{parse_timestamp, to_rfc3339},
    delta::{cursor_candidates, find_by_cursor, reference_matches, server_snapshot_marker},
    error::Result,
    record::Record,
    store::ModuleStore,
    TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

const STATE_FIELDS: [&str; 7] = [
    "paymentState",
    "payment_state",
    "paymentStatus",
    "payment_status",
    "state",
    "payment_state_id",
    "paymentStateId",
];

const UPDATED_AT_FIELDS: [&str; 12] = [
    "updatedAt",
    "updated_at",
    "modifyDate",
    "modify_date",
    "savedAt",
    "saved_at",
    "timestamp",
    "ts",
    "lastUpdatedAt",
    "last_updated_at",
    "lastModifiedAt",
    "last_modified_at",
];

const NESTED_FIELDS: [&str; 6] = ["header", "payload", "meta", "metadata", "data", "info"];

/// Guards a client may attach to a save.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyGuards {
    /// Refuse to create; the record must already exist
    #[serde(alias = "disallowCreate")]
    pub require_existing: bool,
    /// Server snapshot marker must equal this value
    pub require_snapshot_marker: Option<String>,
    /// Client and server snapshot markers must agree
    pub enforce_snapshot: bool,
    #[serde(alias = "expectedPaymentState", alias = "paymentState")]
    pub expected_state: Option<String>,
    #[serde(alias = "rejectPaymentStates")]
    pub reject_states: Vec<String>,
    #[serde(alias = "allowedPaymentStates")]
    pub allowed_states: Vec<String>,
    /// The stored record must not have been updated after this instant
    #[serde(alias = "ifModifiedBefore", alias = "expectedUpdatedAt")]
    pub if_not_modified_since: Option<Value>,
    /// Cursor the client last saw for this record
    pub last_known_id: Option<Value>,
    /// Explicit lookup cursor when the record itself carries no key
    #[serde(alias = "recordRef", alias = "lookup")]
    pub record_cursor: Option<Value>,
}

impl ConcurrencyGuards {
    /// Whether any guard is set.
    pub fn is_empty(&self) -> bool {
        *self == ConcurrencyGuards::default()
    }
}

/// A failed guard.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum GuardConflict {
    #[error("existing record required in \"{table}\" but not found")]
    RecordNotFound { table: TableName },

    #[error("snapshot marker mismatch (expected {expected:?}, server {actual:?})")]
    SnapshotMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("payment state is {actual}, expected {expected}")]
    PaymentStateConflict { expected: String, actual: String },

    #[error("payment state {actual} is rejected")]
    PaymentStateRejected { actual: String, rejected: Vec<String> },

    #[error("payment state {actual} is not allowed")]
    PaymentStateNotAllowed { actual: String, allowed: Vec<String> },

    #[error("record was updated at {updated_at}, after {threshold}")]
    ConcurrentUpdate { updated_at: String, threshold: String },

    #[error("cursor {provided} no longer identifies the record")]
    StaleCursor { provided: Value },
}

impl GuardConflict {
    pub fn code(&self) -> &'static str {
        match self {
            GuardConflict::RecordNotFound { .. } => "record-not-found",
            GuardConflict::SnapshotMismatch { .. } => "snapshot-mismatch",
            GuardConflict::PaymentStateConflict { .. } => "payment-state-conflict",
            GuardConflict::PaymentStateRejected { .. } => "payment-state-rejected",
            GuardConflict::PaymentStateNotAllowed { .. } => "payment-state-not-allowed",
            GuardConflict::ConcurrentUpdate { .. } => "concurrent-update",
            GuardConflict::StaleCursor { .. } => "stale-cursor",
        }
    }

    /// Whether the client must drop its local view and full-sync.
    pub fn requires_full_sync(&self) -> bool {
        matches!(
            self,
            GuardConflict::RecordNotFound { .. }
                | GuardConflict::SnapshotMismatch { .. }
                | GuardConflict::StaleCursor { .. }
        )
    }
}

/// Outcome of [`evaluate_guards`].
#[derive(Debug, Clone, PartialEq)]
pub struct GuardOutcome {
    pub conflict: Option<GuardConflict>,
    /// Stored record the guards were checked against
    pub existing: Option<Record>,
}

impl GuardOutcome {
    pub fn requires_full_sync(&self) -> bool {
        self.conflict
            .as_ref()
            .is_some_and(GuardConflict::requires_full_sync)
    }
}

/// Breadth-first search through a record and its usual nested envelopes.
fn search_nested<T>(record: &Record, mut probe: impl FnMut(&Record) -> Option<T>) -> Option<T> {
    let mut queue: VecDeque<&Record> = VecDeque::from([record]);
    while let Some(current) = queue.pop_front() {
        if let Some(found) = probe(current) {
            return Some(found);
        }
        for key in NESTED_FIELDS {
            if let Some(Value::Object(nested)) = current.get(key) {
                queue.push_back(nested);
            }
        }
    }
    None
}

/// The business (payment) state of a record.
pub fn extract_payment_state(record: &Record) -> Option<String> {
    search_nested(record, |current| {
        STATE_FIELDS.iter().find_map(|field| match current.get(*field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        })
    })
}

/// Last-modified instant of a record.
pub fn extract_updated_at(record: &Record) -> Option<Timestamp> {
    search_nested(record, |current| {
        UPDATED_AT_FIELDS
            .iter()
            .find_map(|field| current.get(*field).and_then(parse_timestamp))
    })
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter()
        .map(|entry| entry.trim())
        .any(|entry| !entry.is_empty() && entry.eq_ignore_ascii_case(value))
}

fn clean(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Check `guards` for a save of `record` into `table`.
///
/// `client_marker` is the snapshot marker the client reported alongside
/// the save, if any.
pub fn evaluate_guards(
    store: &ModuleStore,
    table: &str,
    record: &Record,
    guards: &ConcurrencyGuards,
    client_marker: Option<&str>,
) -> Result<GuardOutcome> {
    let server_marker = server_snapshot_marker(store.meta());

    let existing = match store.find(table, record)? {
        Some(found) => Some(found),
        None => match &guards.record_cursor {
            Some(cursor) => find_by_cursor(store, table, cursor)?,
            None => None,
        },
    };
    let outcome = |conflict: Option<GuardConflict>| GuardOutcome {
        conflict,
        existing: existing.cloned(),
    };

    if existing.is_none() && guards.require_existing {
        return Ok(outcome(Some(GuardConflict::RecordNotFound {
            table: table.to_string(),
        })));
    }

    if let Some(expected) = guards
        .require_snapshot_marker
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
    {
        if let Some(actual) = &server_marker {
            if expected != actual {
                return Ok(outcome(Some(GuardConflict::SnapshotMismatch {
                    expected: Some(expected.to_string()),
                    actual: Some(actual.clone()),
                })));
            }
        }
    }

    if guards.enforce_snapshot {
        if let (Some(client), Some(server)) = (client_marker, &server_marker) {
            if client != server {
                return Ok(outcome(Some(GuardConflict::SnapshotMismatch {
                    expected: Some(client.to_string()),
                    actual: Some(server.clone()),
                })));
            }
        }
    }

    let Some(current) = existing else {
        return Ok(outcome(None));
    };

    let state = extract_payment_state(current);
    if let Some(state) = &state {
        if let Some(expected) = guards
            .expected_state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            if expected != state {
                return Ok(outcome(Some(GuardConflict::PaymentStateConflict {
                    expected: expected.to_string(),
                    actual: state.clone(),
                })));
            }
        }
        if contains_ignore_case(&guards.reject_states, state) {
            return Ok(outcome(Some(GuardConflict::PaymentStateRejected {
                actual: state.clone(),
                rejected: clean(&guards.reject_states),
            })));
        }
        let allowed = clean(&guards.allowed_states);
        if !allowed.is_empty() && !contains_ignore_case(&allowed, state) {
            return Ok(outcome(Some(GuardConflict::PaymentStateNotAllowed {
                actual: state.clone(),
                allowed,
            })));
        }
    }

    if let Some(threshold) = guards.if_not_modified_since.as_ref().and_then(parse_timestamp) {
        if let Some(updated) = extract_updated_at(current) {
            if updated > threshold {
                return Ok(outcome(Some(GuardConflict::ConcurrentUpdate {
                    updated_at: to_rfc3339(updated),
                    threshold: to_rfc3339(threshold),
                })));
            }
        }
    }

    if let Some(last_known) = &guards.last_known_id {
        let candidates = cursor_candidates(last_known);
        if !candidates.is_empty() {
            let reference = store.record_reference(table, current)?;
            if !reference_matches(&reference, &candidates) {
                return Ok(outcome(Some(GuardConflict::StaleCursor {
                    provided: last_known.clone(),
                })));
            }
        }
    }

    Ok(outcome(None))
}
