//! Sequence allocation backed by durable storage.
//!
//! Counters live in the `__sequences` table under module `*`, one row per
//! `module:table:field`. Allocation is serialized process-wide.

use std::sync::Arc;

use pos_sync_engine::{
    sequence::{apply_allocation, pending_fields, sequence_key},
    Record, SequenceRule, SequenceRules,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::db::{DurableError, DurableStore, TableScope};

pub const SEQUENCE_TABLE: &str = "__sequences";
const SEQUENCE_MODULE: &str = "*";

/// A value handed out for one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub field: String,
    pub value: u64,
    pub formatted: String,
}

/// Hands out formatted counters for sequenced fields.
#[derive(Debug)]
pub struct SequenceAllocator<D> {
    durable: Arc<D>,
    rules: SequenceRules,
    lock: Mutex<()>,
}

impl<D: DurableStore> SequenceAllocator<D> {
    pub fn new(durable: Arc<D>, rules: SequenceRules) -> Self {
        Self {
            durable,
            rules,
            lock: Mutex::new(()),
        }
    }

    /// Next counter for one field.
    pub async fn next_value(
        &self,
        branch_id: &str,
        module_id: &str,
        table: &str,
        field: &str,
        rule: &SequenceRule,
    ) -> Result<Allocation, DurableError> {
        let _guard = self.lock.lock().await;
        let scope = TableScope::new(SEQUENCE_TABLE, branch_id, SEQUENCE_MODULE);
        let key = sequence_key(module_id, table, field);

        let last = self
            .durable
            .get(scope, &key)
            .await?
            .and_then(|row| row.get("value").and_then(Value::as_u64));
        let value = rule.next_value(last);

        let row = json!({"key": key, "value": value});
        if let Value::Object(row) = row {
            self.durable.put(scope, &key, &row).await?;
        }
        tracing::debug!(branch_id = %branch_id, key = %key, value, "allocated sequence value");

        Ok(Allocation {
            field: field.to_string(),
            value,
            formatted: rule.format(value),
        })
    }

    /// Fill every empty sequenced field of `record`.
    pub async fn apply(
        &self,
        branch_id: &str,
        module_id: &str,
        table: &str,
        record: &mut Record,
    ) -> Result<Vec<Allocation>, DurableError> {
        let Some(rules) = self.rules.for_table(branch_id, module_id, table) else {
            return Ok(Vec::new());
        };
        let pending: Vec<(String, SequenceRule)> = pending_fields(rules, record)
            .into_iter()
            .map(|(field, rule)| (field.to_string(), rule.clone()))
            .collect();

        let mut allocations = Vec::with_capacity(pending.len());
        for (field, rule) in pending {
            let allocation = self
                .next_value(branch_id, module_id, table, &field, &rule)
                .await?;
            apply_allocation(record, &field, &rule, allocation.value);
            allocations.push(allocation);
        }
        Ok(allocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDurableStore;

    fn allocator(durable: Arc<MemoryDurableStore>) -> SequenceAllocator<MemoryDurableStore> {
        let rule: SequenceRule =
            serde_json::from_value(json!({"prefix": "INV", "padding": 4, "counterField": "invoiceSeq"}))
                .unwrap();
        SequenceAllocator::new(
            durable,
            SequenceRules::default().with_default("pos", "order_header", "invoiceNo", rule),
        )
    }

    #[tokio::test]
    async fn fills_empty_fields_in_order() {
        let durable = Arc::new(MemoryDurableStore::new());
        let allocator = allocator(durable.clone());

        let mut first = json!({"id": "o1"}).as_object().cloned().unwrap();
        allocator.apply("b1", "pos", "order_header", &mut first).await.unwrap();
        assert_eq!(first["invoiceNo"], json!("INV-0001"));
        assert_eq!(first["invoiceSeq"], json!(1));

        let mut second = json!({"id": "o2", "invoiceNo": ""}).as_object().cloned().unwrap();
        allocator.apply("b1", "pos", "order_header", &mut second).await.unwrap();
        assert_eq!(second["invoiceNo"], json!("INV-0002"));

        let mut other_branch = json!({"id": "o3"}).as_object().cloned().unwrap();
        allocator.apply("b2", "pos", "order_header", &mut other_branch).await.unwrap();
        assert_eq!(other_branch["invoiceNo"], json!("INV-0001"));

        let scope = TableScope::new(SEQUENCE_TABLE, "b1", "*");
        let stored = durable.get(scope, "pos:order_header:invoiceNo").await.unwrap().unwrap();
        assert_eq!(stored["value"], json!(2));
    }

    #[tokio::test]
    async fn filled_fields_and_unruled_tables_are_left_alone() {
        let allocator = allocator(Arc::new(MemoryDurableStore::new()));

        let mut given = json!({"id": "o1", "invoiceNo": "MANUAL-1"}).as_object().cloned().unwrap();
        let allocations = allocator.apply("b1", "pos", "order_header", &mut given).await.unwrap();
        assert!(allocations.is_empty());
        assert_eq!(given["invoiceNo"], json!("MANUAL-1"));

        let mut line = json!({"orderId": "o1"}).as_object().cloned().unwrap();
        assert!(allocator.apply("b1", "pos", "order_line", &mut line).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn durable_failures_propagate() {
        let durable = Arc::new(MemoryDurableStore::new());
        let allocator = allocator(durable.clone());
        durable.set_fail_writes(true);

        let mut record = json!({"id": "o1"}).as_object().cloned().unwrap();
        assert!(allocator.apply("b1", "pos", "order_header", &mut record).await.is_err());
        assert!(record.get("invoiceNo").is_none());
    }
}
