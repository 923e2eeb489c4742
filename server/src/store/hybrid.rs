//! Write-through cache over a module dataset.
//!
//! Persisted tables are reloaded from durable storage once their cache entry
//! is older than the TTL. Every mutation is applied in memory first, then
//! written through; if either step fails the in-memory tables, version and
//! meta are rolled back so both layers stay identical.

use std::collections::HashMap;
use std::sync::Arc;

use pos_sync_engine::store::StoreBackup;
use pos_sync_engine::{
    ClearReport, IncomingSnapshot, ModuleSnapshot, ModuleStore, Record, RecordKey, RestoreMode,
    RestoreReport, SaveOutcome, SharedClock, TableName, TableRows, Timestamp, Version,
};

use super::StoreError;
use crate::db::{DurableStore, TableScope};

/// Result of a refresh check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Rows were reloaded from durable storage
    Reloaded,
    /// The cache entry was still fresh
    CacheHit,
    /// The table is memory-only
    NotPersisted,
}

enum RowWrite {
    Put,
    Delete,
}

/// A module dataset kept coherent with durable storage.
#[derive(Debug)]
pub struct HybridStore<D> {
    store: ModuleStore,
    durable: Arc<D>,
    branch_id: String,
    module_id: String,
    persisted: Vec<TableName>,
    loaded_at: HashMap<TableName, Timestamp>,
    ttl_ms: u64,
    clock: SharedClock,
    bootstrapped: bool,
    event_sequence: u64,
}

impl<D: DurableStore> HybridStore<D> {
    /// Wrap `store`. Only persisted tables that belong to the module are
    /// written through; the rest stay memory-only.
    pub fn new(
        store: ModuleStore,
        durable: Arc<D>,
        persisted: &[TableName],
        ttl_ms: u64,
        clock: SharedClock,
    ) -> Self {
        let persisted = persisted
            .iter()
            .filter(|table| store.has_table(table))
            .cloned()
            .collect();
        Self {
            branch_id: store.branch_id().clone(),
            module_id: store.module_id().clone(),
            store,
            durable,
            persisted,
            loaded_at: HashMap::new(),
            ttl_ms,
            clock,
            bootstrapped: false,
            event_sequence: 0,
        }
    }

    /// The in-memory dataset as of the last refresh.
    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn persisted_tables(&self) -> &[TableName] {
        &self.persisted
    }

    pub fn is_persisted(&self, table: &str) -> bool {
        self.persisted.iter().any(|t| t == table)
    }

    /// Per-dataset counter stamped on broadcast events.
    pub fn next_event_sequence(&mut self) -> u64 {
        self.event_sequence += 1;
        self.event_sequence
    }

    fn scope<'a>(&'a self, table: &'a str) -> TableScope<'a> {
        TableScope::new(table, &self.branch_id, &self.module_id)
    }

    /// Load persisted tables on first use. Durable rows win; a table with no
    /// durable rows is seeded from whatever the in-memory seed holds.
    pub async fn bootstrap(&mut self) -> Result<(), StoreError> {
        if self.bootstrapped {
            return Ok(());
        }
        for table in self.persisted.clone() {
            let rows = self.durable.list(self.scope(&table)).await?;
            if !rows.is_empty() {
                self.store.replace_table_rows(&table, rows)?;
            } else if !self.store.rows(&table)?.is_empty() {
                let keyed = self.keyed_rows(&table)?;
                self.durable.replace(self.scope(&table), &keyed).await?;
                tracing::debug!(
                    branch_id = %self.branch_id,
                    module_id = %self.module_id,
                    table = %table,
                    rows = keyed.len(),
                    "seeded durable table"
                );
            }
            self.loaded_at.insert(table, self.clock.now_millis());
        }
        self.bootstrapped = true;
        Ok(())
    }

    /// Reload a persisted table if its cache entry is missing, expired or
    /// `force` is set.
    pub async fn refresh_table(&mut self, table: &str, force: bool) -> Result<Refresh, StoreError> {
        if !self.is_persisted(table) {
            return Ok(Refresh::NotPersisted);
        }
        self.bootstrap().await?;

        let now = self.clock.now_millis();
        let fresh = self
            .loaded_at
            .get(table)
            .is_some_and(|loaded| now.saturating_sub(*loaded) < self.ttl_ms);
        if fresh && !force {
            return Ok(Refresh::CacheHit);
        }

        let rows = self.durable.list(self.scope(table)).await?;
        self.store.replace_table_rows(table, rows)?;
        self.loaded_at.insert(table.to_string(), now);
        Ok(Refresh::Reloaded)
    }

    pub async fn refresh_all(&mut self) -> Result<(), StoreError> {
        self.bootstrap().await?;
        for table in self.persisted.clone() {
            self.refresh_table(&table, false).await?;
        }
        Ok(())
    }

    /// Drop a table's cache entry so the next read reloads it.
    pub fn invalidate(&mut self, table: &str) {
        self.loaded_at.remove(table);
    }

    pub async fn snapshot(&mut self) -> Result<ModuleSnapshot, StoreError> {
        self.refresh_all().await?;
        Ok(self.store.snapshot())
    }

    pub async fn list_table(&mut self, table: &str) -> Result<Vec<Record>, StoreError> {
        self.refresh_table(table, false).await?;
        Ok(self.store.list_table(table)?)
    }

    /// Current dataset after refreshing every persisted table.
    pub async fn read(&mut self) -> Result<&ModuleStore, StoreError> {
        self.refresh_all().await?;
        Ok(&self.store)
    }

    pub async fn insert(&mut self, table: &str, record: &Record) -> Result<Record, StoreError> {
        self.mutate_row(table, |store| {
            let row = store.insert(table, record)?;
            Ok((row.clone(), row, RowWrite::Put))
        })
        .await
    }

    pub async fn merge(&mut self, table: &str, patch: &Record) -> Result<Record, StoreError> {
        self.mutate_row(table, |store| {
            let row = store.merge(table, patch)?;
            Ok((row.clone(), row, RowWrite::Put))
        })
        .await
    }

    pub async fn save(&mut self, table: &str, record: &Record) -> Result<SaveOutcome, StoreError> {
        self.mutate_row(table, |store| {
            let outcome = store.save(table, record)?;
            let row = outcome.record.clone();
            Ok((outcome, row, RowWrite::Put))
        })
        .await
    }

    pub async fn remove(&mut self, table: &str, criteria: &Record) -> Result<Record, StoreError> {
        self.mutate_row(table, |store| {
            let row = store.remove(table, criteria)?;
            Ok((row.clone(), row, RowWrite::Delete))
        })
        .await
    }

    async fn mutate_row<T, F>(&mut self, table: &str, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut ModuleStore) -> pos_sync_engine::Result<(T, Record, RowWrite)> + Send,
        T: Send,
    {
        self.refresh_table(table, false).await?;
        let backup = self.store.backup(&[table]);

        let (output, row, write) = match apply(&mut self.store) {
            Ok(applied) => applied,
            Err(err) => {
                self.store.restore_backup(backup);
                return Err(err.into());
            }
        };
        if !self.is_persisted(table) {
            return Ok(output);
        }

        let key = match self.store.table_schema(table).and_then(|s| s.require_key(&row)) {
            Ok(resolved) => resolved.key,
            Err(err) => {
                self.store.restore_backup(backup);
                return Err(err.into());
            }
        };
        let scope = self.scope(table);
        let written = match write {
            RowWrite::Put => self.durable.put(scope, &key, &row).await,
            RowWrite::Delete => self.durable.delete(scope, &key).await.map(|_| ()),
        };
        self.invalidate(table);

        if let Err(err) = written {
            tracing::error!(
                branch_id = %self.branch_id,
                module_id = %self.module_id,
                table = %table,
                key = %key,
                error = %err,
                "durable write failed, rolling back"
            );
            self.store.restore_backup(backup);
            return Err(err.into());
        }
        Ok(output)
    }

    /// Empty tables in memory and in durable storage.
    pub async fn clear_tables(&mut self, tables: &[TableName]) -> Result<ClearReport, StoreError> {
        for table in tables {
            self.refresh_table(table, true).await?;
        }
        let backup = self.store.backup(tables);
        let report = self.store.clear_tables(tables);
        let touched: Vec<TableName> = report.cleared.keys().cloned().collect();
        self.write_tables(&touched, backup).await?;
        Ok(report)
    }

    /// Bulk-load rows, e.g. from purge history.
    pub async fn restore_tables(
        &mut self,
        data: &TableRows,
        mode: RestoreMode,
    ) -> Result<RestoreReport, StoreError> {
        let tables: Vec<TableName> = data.keys().cloned().collect();
        for table in &tables {
            self.refresh_table(table, true).await?;
        }
        let backup = self.store.backup(&tables);
        let report = match self.store.restore_tables(data, mode) {
            Ok(report) => report,
            Err(err) => {
                self.store.restore_backup(backup);
                return Err(err.into());
            }
        };
        let touched: Vec<TableName> = tables
            .into_iter()
            .filter(|t| self.store.has_table(t))
            .collect();
        self.write_tables(&touched, backup).await?;
        Ok(report)
    }

    /// Validate and apply a client snapshot, then write every persisted table.
    pub async fn apply_snapshot(&mut self, incoming: &IncomingSnapshot) -> Result<Version, StoreError> {
        self.refresh_all().await?;
        let tables = self.store.table_names().to_vec();
        let backup = self.store.backup(&tables);
        let version = match self.store.apply_snapshot(incoming) {
            Ok(version) => version,
            Err(err) => {
                self.store.restore_backup(backup);
                return Err(err.into());
            }
        };
        self.write_tables(&tables, backup).await?;
        Ok(version)
    }

    /// Clear every table, reload the seed and close the business day.
    pub async fn reset(&mut self, closed_day: Option<String>) -> Result<(), StoreError> {
        self.refresh_all().await?;
        let tables = self.store.table_names().to_vec();
        let backup = self.store.backup(&tables);
        if let Err(err) = self.store.reset(closed_day) {
            self.store.restore_backup(backup);
            return Err(err.into());
        }
        self.write_tables(&tables, backup).await
    }

    /// Replace the durable copy of each persisted table in `tables` with its
    /// in-memory rows, truncating tables left empty. On failure memory is rolled back and tables already
    /// written are put back the way they were.
    async fn write_tables(
        &mut self,
        tables: &[TableName],
        backup: StoreBackup,
    ) -> Result<(), StoreError> {
        let persisted: Vec<TableName> = tables
            .iter()
            .filter(|t| self.is_persisted(t))
            .cloned()
            .collect();

        let mut written = Vec::new();
        let mut failure = None;
        for table in &persisted {
            let result = match self.keyed_rows(table) {
                Ok(rows) if rows.is_empty() => self
                    .durable
                    .truncate(self.scope(table))
                    .await
                    .map(|removed| {
                        tracing::debug!(table = %table, removed, "truncated durable table");
                    })
                    .map_err(StoreError::from),
                Ok(rows) => self
                    .durable
                    .replace(self.scope(table), &rows)
                    .await
                    .map_err(StoreError::from),
                Err(err) => Err(err),
            };
            self.invalidate(table);
            match result {
                Ok(()) => written.push(table.clone()),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };
        tracing::error!(
            branch_id = %self.branch_id,
            module_id = %self.module_id,
            error = %err,
            "durable table write failed, rolling back"
        );
        self.store.restore_backup(backup);
        for table in &written {
            let restored = match self.keyed_rows(table) {
                Ok(rows) => self.durable.replace(self.scope(table), &rows).await.is_ok(),
                Err(_) => false,
            };
            if !restored {
                tracing::error!(table = %table, "could not restore durable table after rollback");
            }
        }
        Err(err)
    }

    fn keyed_rows(&self, table: &str) -> Result<Vec<(RecordKey, Record)>, StoreError> {
        let schema = self.store.table_schema(table)?;
        let rows = self.store.rows(table)?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            keyed.push((schema.require_key(row)?.key, row.clone()));
        }
        Ok(keyed)
    }
}
