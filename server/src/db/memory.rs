//! In-memory durable store.
//!
//! Used when no `DATABASE_URL` is configured and throughout the tests, where
//! write failures can be injected to exercise rollback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pos_sync_engine::{Record, RecordKey};

use super::{DurableError, DurableStore, TableScope};

type ScopeKey = (String, String, String);

fn scope_key(scope: TableScope<'_>) -> ScopeKey {
    (
        scope.table.to_string(),
        scope.branch_id.to_string(),
        scope.module_id.to_string(),
    )
}

/// Durable store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    tables: Mutex<HashMap<ScopeKey, Vec<(RecordKey, Record)>>>,
    fail_writes: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched off again.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), DurableError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DurableError::Unavailable("write failure injected".into()));
        }
        Ok(())
    }

    /// Number of stored rows for a table.
    #[cfg(test)]
    pub fn row_count(&self, scope: TableScope<'_>) -> usize {
        self.tables
            .lock()
            .get(&scope_key(scope))
            .map_or(0, Vec::len)
    }

    /// Whether the table has an entry at all. Truncation removes it.
    #[cfg(test)]
    pub fn holds_table(&self, scope: TableScope<'_>) -> bool {
        self.tables.lock().contains_key(&scope_key(scope))
    }
}

impl DurableStore for MemoryDurableStore {
    async fn list(&self, scope: TableScope<'_>) -> Result<Vec<Record>, DurableError> {
        Ok(self
            .tables
            .lock()
            .get(&scope_key(scope))
            .map(|rows| rows.iter().map(|(_, row)| row.clone()).collect())
            .unwrap_or_default())
    }

    async fn get(&self, scope: TableScope<'_>, key: &str) -> Result<Option<Record>, DurableError> {
        Ok(self.tables.lock().get(&scope_key(scope)).and_then(|rows| {
            rows.iter()
                .find(|(stored, _)| stored == key)
                .map(|(_, row)| row.clone())
        }))
    }

    async fn put(&self, scope: TableScope<'_>, key: &str, record: &Record) -> Result<(), DurableError> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let rows = tables.entry(scope_key(scope)).or_default();
        match rows.iter_mut().find(|(stored, _)| stored == key) {
            Some((_, row)) => *row = record.clone(),
            None => rows.push((key.to_string(), record.clone())),
        }
        Ok(())
    }

    async fn delete(&self, scope: TableScope<'_>, key: &str) -> Result<bool, DurableError> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let Some(rows) = tables.get_mut(&scope_key(scope)) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|(stored, _)| stored != key);
        Ok(rows.len() != before)
    }

    async fn truncate(&self, scope: TableScope<'_>) -> Result<u64, DurableError> {
        self.check_writable()?;
        Ok(self
            .tables
            .lock()
            .remove(&scope_key(scope))
            .map_or(0, |rows| rows.len() as u64))
    }

    async fn replace(
        &self,
        scope: TableScope<'_>,
        rows: &[(RecordKey, Record)],
    ) -> Result<(), DurableError> {
        self.check_writable()?;
        self.tables.lock().insert(scope_key(scope), rows.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, status: &str) -> Record {
        json!({"id": id, "status": status}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn put_replaces_in_place() {
        let store = MemoryDurableStore::new();
        let scope = TableScope::new("order_header", "b1", "pos");

        store.put(scope, "o1", &row("o1", "open")).await.unwrap();
        store.put(scope, "o2", &row("o2", "open")).await.unwrap();
        store.put(scope, "o1", &row("o1", "paid")).await.unwrap();

        let rows = store.list(scope).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["status"], json!("paid"));
        assert_eq!(rows[1]["id"], json!("o2"));
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = MemoryDurableStore::new();
        store
            .put(TableScope::new("order_header", "b1", "pos"), "o1", &row("o1", "open"))
            .await
            .unwrap();

        let other = TableScope::new("order_header", "b2", "pos");
        assert!(store.list(other).await.unwrap().is_empty());
        assert!(store.get(other, "o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_block_writes_only() {
        let store = MemoryDurableStore::new();
        let scope = TableScope::new("order_header", "b1", "pos");
        store.put(scope, "o1", &row("o1", "open")).await.unwrap();

        store.set_fail_writes(true);
        assert!(matches!(
            store.put(scope, "o2", &row("o2", "open")).await,
            Err(DurableError::Unavailable(_))
        ));
        assert!(store.delete(scope, "o1").await.is_err());
        assert_eq!(store.list(scope).await.unwrap().len(), 1);

        store.set_fail_writes(false);
        assert_eq!(store.truncate(scope).await.unwrap(), 1);
        assert_eq!(store.row_count(scope), 0);
    }
}
