//! Per-dataset store registry.
//!
//! Each (branch, module) dataset sits behind its own async mutex, so
//! mutations on one dataset are applied strictly one at a time while
//! different branches proceed in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use pos_sync_engine::{ModuleStore, Schema, SharedClock, TableName, TableRows};
use tokio::sync::Mutex;

use super::{HybridStore, StoreError};
use crate::db::{Durable, DurableStore};

/// A dataset shared between connections.
pub type SharedModule<D = Durable> = Arc<Mutex<HybridStore<D>>>;

/// Lazily creates and hands out module datasets.
#[derive(Debug)]
pub struct ModuleRegistry<D = Durable> {
    schema: Arc<Schema>,
    durable: Arc<D>,
    clock: SharedClock,
    persisted: Vec<TableName>,
    ttl_ms: u64,
    seeds: DashMap<String, TableRows>,
    modules: DashMap<(String, String), SharedModule<D>>,
}

impl<D: DurableStore> ModuleRegistry<D> {
    pub fn new(
        schema: Arc<Schema>,
        durable: Arc<D>,
        clock: SharedClock,
        persisted: Vec<TableName>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            schema,
            durable,
            clock,
            persisted,
            ttl_ms,
            seeds: DashMap::new(),
            modules: DashMap::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Seed rows loaded into every new dataset of `module_id` and again on
    /// each reset.
    pub fn set_seed(&self, module_id: &str, seed: TableRows) {
        self.seeds.insert(module_id.to_string(), seed);
    }

    /// Module ids declared by the schema, sorted.
    pub fn module_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.schema.modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Dataset for (branch, module), created on first use.
    pub fn get(&self, branch_id: &str, module_id: &str) -> Result<SharedModule<D>, StoreError> {
        let key = (branch_id.to_string(), module_id.to_string());
        if let Some(existing) = self.modules.get(&key) {
            return Ok(existing.clone());
        }

        let mut store = ModuleStore::new(&self.schema, branch_id, module_id, self.clock.clone())?;
        if let Some(seed) = self.seeds.get(module_id) {
            store = store.with_seed(seed.clone())?;
        }
        let hybrid = HybridStore::new(
            store,
            self.durable.clone(),
            &self.persisted,
            self.ttl_ms,
            self.clock.clone(),
        );

        let shared = self
            .modules
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(hybrid)))
            .clone();
        tracing::debug!(branch_id = %branch_id, module_id = %module_id, "module dataset ready");
        Ok(shared)
    }

    /// Number of datasets created so far.
    pub fn len(&self) -> usize {
        self.modules.len()
    }
}
