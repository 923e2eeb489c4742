//! Bounded cache of the latest sync payload per dataset.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, Value>,
    order: VecDeque<String>,
}

/// Latest sync payload per `branch::module`, oldest evicted first.
#[derive(Debug)]
pub struct SyncStateCache {
    limit: usize,
    entries: Mutex<Entries>,
}

pub fn state_key(branch_id: &str, module_id: &str) -> String {
    format!("{branch_id}::{module_id}")
}

impl SyncStateCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn get(&self, branch_id: &str, module_id: &str) -> Option<Value> {
        self.entries
            .lock()
            .values
            .get(&state_key(branch_id, module_id))
            .cloned()
    }

    pub fn put(&self, branch_id: &str, module_id: &str, payload: Value) {
        let key = state_key(branch_id, module_id);
        let mut entries = self.entries.lock();
        if entries.values.insert(key.clone(), payload).is_none() {
            entries.order.push_back(key);
        }
        while entries.order.len() > self.limit {
            if let Some(evicted) = entries.order.pop_front() {
                entries.values.remove(&evicted);
                tracing::debug!(key = %evicted, "evicted sync state");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }
}
