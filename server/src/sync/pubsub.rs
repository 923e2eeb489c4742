//! Topic registry with retained payloads.
//!
//! Every topic keeps the last payload published on it. New subscribers are
//! bootstrapped from it, and each publish is sent as a delta envelope
//! against it.

use std::collections::BTreeSet;

use dashmap::DashMap;
use pos_sync_engine::{delta_envelope, Envelope};
use serde_json::Value;

const SYNC_PREFIX: &str = "sync::";
const LEGACY_POS_PREFIX: &str = "pos:sync:";
const TABLE_PREFIX: &str = "sync-table::";
const DEFAULT_BRANCH: &str = "default";
const DEFAULT_MODULE: &str = "pos";

/// Sync topic of a dataset.
pub fn sync_topic(branch_id: &str, module_id: &str) -> String {
    format!("{SYNC_PREFIX}{branch_id}::{module_id}")
}

/// Topics a dataset's payload is published on, canonical first.
pub fn dataset_topics(branch_id: &str, module_id: &str) -> Vec<String> {
    let mut topics = vec![sync_topic(branch_id, module_id)];
    if module_id == DEFAULT_MODULE {
        topics.push(format!("{LEGACY_POS_PREFIX}{branch_id}"));
    }
    topics
}

/// Table notice topics for a table of a dataset.
pub fn table_topics(branch_id: &str, module_id: &str, table: &str) -> [String; 2] {
    [
        format!("{TABLE_PREFIX}{branch_id}::{module_id}::{table}"),
        format!("{TABLE_PREFIX}{branch_id}::{table}"),
    ]
}

fn or_default<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(default)
}

/// The (branch, module) a sync topic addresses, if it is one.
pub fn parse_sync_topic(topic: &str) -> Option<(String, String)> {
    if let Some(rest) = topic.strip_prefix(SYNC_PREFIX) {
        let mut parts = rest.splitn(2, "::");
        let branch = or_default(parts.next(), DEFAULT_BRANCH);
        let module = or_default(parts.next(), DEFAULT_MODULE);
        return Some((branch.to_string(), module.to_string()));
    }
    topic.strip_prefix(LEGACY_POS_PREFIX).map(|branch| {
        (
            or_default(Some(branch), DEFAULT_BRANCH).to_string(),
            DEFAULT_MODULE.to_string(),
        )
    })
}

#[derive(Debug, Default)]
struct Topic {
    last_data: Option<Value>,
    subscribers: BTreeSet<String>,
}

/// A publish ready to fan out.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub envelope: Envelope,
    pub subscribers: Vec<String>,
}

/// Process-wide topic registry.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: DashMap<String, Topic>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber; returns the retained payload, if any.
    pub fn subscribe(&self, topic: &str, conn_id: &str) -> Option<Value> {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        entry.subscribers.insert(conn_id.to_string());
        entry.last_data.clone()
    }

    pub fn unsubscribe(&self, topic: &str, conn_id: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.subscribers.remove(conn_id);
        }
    }

    /// Drop a closed connection from every topic.
    pub fn unsubscribe_all(&self, conn_id: &str) {
        for mut entry in self.topics.iter_mut() {
            entry.subscribers.remove(conn_id);
        }
    }

    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|entry| entry.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retain `data` without fanning it out.
    pub fn retain(&self, topic: &str, data: Value) {
        self.topics.entry(topic.to_string()).or_default().last_data = Some(data);
    }

    /// Retain `data` and compute the envelope for current subscribers.
    /// Returns `None` when nothing changed.
    pub fn publish(&self, topic: &str, data: Value) -> Option<Publication> {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let envelope = delta_envelope(entry.last_data.as_ref(), &data)?;
        entry.last_data = Some(data);
        Some(Publication {
            envelope,
            subscribers: entry.subscribers.iter().cloned().collect(),
        })
    }

    /// Forget retained payloads of the given topics, e.g. after a reset.
    pub fn forget(&self, topics: &[String]) {
        for topic in topics {
            if let Some(mut entry) = self.topics.get_mut(topic) {
                entry.last_data = None;
            }
        }
    }
}
