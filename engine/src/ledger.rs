//! Transaction dedup ledger.
//!
//! Remembers the result of recently accepted client transactions so that a
//! retried publish is answered from history instead of being applied twice.

use crate::Timestamp;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Default number of transactions remembered per dataset.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;
/// Default number of mutation ids remembered per transaction.
pub const DEFAULT_MUTATION_LIMIT: usize = 25;

const MIN_HISTORY_LIMIT: usize = 50;
const MIN_MUTATION_LIMIT: usize = 5;

/// Size bounds of a [`TransactionLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLimits {
    pub history: usize,
    pub mutations: usize,
}

impl LedgerLimits {
    /// Limits clamped to their minimums.
    pub fn new(history: usize, mutations: usize) -> Self {
        Self {
            history: history.max(MIN_HISTORY_LIMIT),
            mutations: mutations.max(MIN_MUTATION_LIMIT),
        }
    }
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT, DEFAULT_MUTATION_LIMIT)
    }
}

/// A remembered transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub trans_id: String,
    /// Result returned when the transaction was first accepted
    pub payload: Value,
    pub mutation_ids: VecDeque<String>,
    pub last_ack_mutation_id: Option<String>,
    pub recorded_at: Timestamp,
}

impl TransactionRecord {
    fn acknowledge(&mut self, mutation_id: &str, limit: usize) {
        if !self.mutation_ids.iter().any(|id| id == mutation_id) {
            self.mutation_ids.push_back(mutation_id.to_string());
            while self.mutation_ids.len() > limit {
                self.mutation_ids.pop_front();
            }
        }
        self.last_ack_mutation_id = Some(mutation_id.to_string());
    }

    pub fn has_mutation(&self, mutation_id: &str) -> bool {
        self.mutation_ids.iter().any(|id| id == mutation_id)
    }
}

/// Answer to a replayed transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// The originally stored result, unchanged
    pub payload: Value,
    /// Mutation acknowledged before this replay
    pub previous_mutation_id: Option<String>,
    /// Mutation this replay acknowledges
    pub acked_mutation_id: Option<String>,
}

/// Bounded, insertion-ordered transaction history for one dataset.
#[derive(Debug, Clone, Default)]
pub struct TransactionLedger {
    limits: LedgerLimits,
    order: VecDeque<String>,
    records: HashMap<String, TransactionRecord>,
}

impl TransactionLedger {
    pub fn new(limits: LedgerLimits) -> Self {
        Self {
            limits,
            order: VecDeque::new(),
            records: HashMap::new(),
        }
    }

    pub fn limits(&self) -> LedgerLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record the result of an accepted transaction. An already known id
    /// keeps its original payload and only learns the mutation id.
    pub fn remember(
        &mut self,
        trans_id: &str,
        payload: Value,
        mutation_id: Option<&str>,
        now: Timestamp,
    ) {
        if !self.records.contains_key(trans_id) {
            self.order.push_back(trans_id.to_string());
            self.records.insert(
                trans_id.to_string(),
                TransactionRecord {
                    trans_id: trans_id.to_string(),
                    payload,
                    mutation_ids: VecDeque::new(),
                    last_ack_mutation_id: None,
                    recorded_at: now,
                },
            );
            while self.order.len() > self.limits.history {
                if let Some(evicted) = self.order.pop_front() {
                    self.records.remove(&evicted);
                }
            }
        }
        let limit = self.limits.mutations;
        if let (Some(record), Some(mutation_id)) = (self.records.get_mut(trans_id), mutation_id) {
            record.acknowledge(mutation_id, limit);
        }
    }

    pub fn recall(&self, trans_id: &str) -> Option<&TransactionRecord> {
        self.records.get(trans_id)
    }

    /// Answer a retried transaction from history, acknowledging
    /// `requested_mutation_id` if given.
    pub fn replay(&mut self, trans_id: &str, requested_mutation_id: Option<&str>) -> Option<Replay> {
        let limit = self.limits.mutations;
        let record = self.records.get_mut(trans_id)?;
        let previous = record.last_ack_mutation_id.clone();
        if let Some(requested) = requested_mutation_id {
            record.acknowledge(requested, limit);
        }
        Some(Replay {
            payload: record.payload.clone(),
            acked_mutation_id: requested_mutation_id.map(str::to_string).or_else(|| previous.clone()),
            previous_mutation_id: previous,
        })
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.records.clear();
    }
}

/// Normalize a client-supplied transaction id: trimmed non-empty strings and
/// finite numbers are accepted.
pub fn normalize_trans_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
