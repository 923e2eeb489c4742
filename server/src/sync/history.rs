//! In-memory purge history, so purged rows can be restored.

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;
use pos_sync_engine::{TableName, TableRows};
use serde::Serialize;

use super::state::state_key;

/// Entries kept per dataset.
pub const PURGE_HISTORY_LIMIT: usize = 20;

/// Rows removed by one purge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeEntry {
    pub id: String,
    pub branch_id: String,
    pub module_id: String,
    pub purged_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub tables: Vec<TableName>,
    pub counts: BTreeMap<TableName, usize>,
    #[serde(skip)]
    pub records: TableRows,
}

/// Bounded purge history per `branch::module`, newest last.
#[derive(Debug, Default)]
pub struct PurgeHistory {
    entries: DashMap<String, VecDeque<PurgeEntry>>,
}

impl PurgeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: PurgeEntry) {
        let mut entries = self
            .entries
            .entry(state_key(&entry.branch_id, &entry.module_id))
            .or_default();
        entries.push_back(entry);
        while entries.len() > PURGE_HISTORY_LIMIT {
            entries.pop_front();
        }
    }

    pub fn list(&self, branch_id: &str, module_id: &str) -> Vec<PurgeEntry> {
        self.entries
            .get(&state_key(branch_id, module_id))
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, branch_id: &str, module_id: &str, id: &str) -> Option<PurgeEntry> {
        self.entries
            .get(&state_key(branch_id, module_id))?
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: usize) -> PurgeEntry {
        PurgeEntry {
            id: format!("purge-{id}"),
            branch_id: "b1".into(),
            module_id: "pos".into(),
            purged_at: "2024-02-01T00:00:00.000Z".into(),
            reason: None,
            requested_by: None,
            tables: vec!["order_header".into()],
            counts: BTreeMap::new(),
            records: TableRows::new(),
        }
    }

    #[test]
    fn keeps_latest_entries() {
        let history = PurgeHistory::new();
        for id in 0..25 {
            history.record(entry(id));
        }
        let entries = history.list("b1", "pos");
        assert_eq!(entries.len(), PURGE_HISTORY_LIMIT);
        assert_eq!(entries[0].id, "purge-5");
        assert!(history.find("b1", "pos", "purge-4").is_none());
        assert!(history.find("b1", "pos", "purge-24").is_some());
        assert!(history.list("b2", "pos").is_empty());
    }

    #[test]
    fn rows_stay_out_of_listings() {
        let value = serde_json::to_value(entry(1)).unwrap();
        assert!(value.get("records").is_none());
        assert_eq!(value["tables"][0], "order_header");
    }
}
