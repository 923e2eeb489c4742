//! Transaction ledgers per dataset.

use dashmap::DashMap;
use pos_sync_engine::{LedgerLimits, Replay, Timestamp, TransactionLedger};
use serde_json::Value;

use super::state::state_key;

/// One [`TransactionLedger`] per `branch::module`.
#[derive(Debug)]
pub struct LedgerRegistry {
    limits: LedgerLimits,
    ledgers: DashMap<String, TransactionLedger>,
}

impl LedgerRegistry {
    pub fn new(limits: LedgerLimits) -> Self {
        Self {
            limits,
            ledgers: DashMap::new(),
        }
    }

    /// Stored answer for a retried transaction, if any.
    pub fn replay(
        &self,
        branch_id: &str,
        module_id: &str,
        trans_id: &str,
        mutation_id: Option<&str>,
    ) -> Option<Replay> {
        self.ledgers
            .get_mut(&state_key(branch_id, module_id))?
            .replay(trans_id, mutation_id)
    }

    pub fn remember(
        &self,
        branch_id: &str,
        module_id: &str,
        trans_id: &str,
        payload: Value,
        mutation_id: Option<&str>,
        now: Timestamp,
    ) {
        self.ledgers
            .entry(state_key(branch_id, module_id))
            .or_insert_with(|| TransactionLedger::new(self.limits))
            .remember(trans_id, payload, mutation_id, now);
    }

    /// Transactions remembered for a dataset.
    pub fn len(&self, branch_id: &str, module_id: &str) -> usize {
        self.ledgers
            .get(&state_key(branch_id, module_id))
            .map_or(0, |ledger| ledger.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ledgers_are_per_dataset() {
        let registry = LedgerRegistry::new(LedgerLimits::default());
        registry.remember("b1", "pos", "t1", json!({"v": 1}), Some("m1"), 0);

        assert!(registry.replay("b2", "pos", "t1", None).is_none());
        let replay = registry.replay("b1", "pos", "t1", Some("m2")).unwrap();
        assert_eq!(replay.payload, json!({"v": 1}));
        assert_eq!(replay.previous_mutation_id.as_deref(), Some("m1"));
        assert_eq!(registry.len("b1", "pos"), 1);
        assert_eq!(registry.len("b1", "kds"), 0);
    }
}
