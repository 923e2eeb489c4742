//! Durable storage behind the write-through cache.
//!
//! Durable storage is a keyed service: one stored row per
//! (table, branch, module, primary key). PostgreSQL backs it in production;
//! the in-memory implementation serves tests and database-less deployments.

mod memory;
mod pool;
mod records;

use std::future::Future;

use pos_sync_engine::{Record, RecordKey};

pub use memory::MemoryDurableStore;
pub use pool::*;
pub use records::PgDurableStore;

/// Table and dataset a durable operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableScope<'a> {
    pub table: &'a str,
    pub branch_id: &'a str,
    pub module_id: &'a str,
}

impl<'a> TableScope<'a> {
    pub fn new(table: &'a str, branch_id: &'a str, module_id: &'a str) -> Self {
        Self {
            table,
            branch_id,
            module_id,
        }
    }
}

/// Errors raised by durable storage.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored row {key} in {table} is not a record")]
    Corrupt { table: String, key: RecordKey },

    #[error("Durable storage unavailable: {0}")]
    Unavailable(String),
}

/// Keyed get/put/delete/list service.
///
/// `list` returns rows in insertion order. `put` on an existing key replaces
/// the row in place.
pub trait DurableStore: Send + Sync + 'static {
    fn list(
        &self,
        scope: TableScope<'_>,
    ) -> impl Future<Output = Result<Vec<Record>, DurableError>> + Send;

    fn get(
        &self,
        scope: TableScope<'_>,
        key: &str,
    ) -> impl Future<Output = Result<Option<Record>, DurableError>> + Send;

    fn put(
        &self,
        scope: TableScope<'_>,
        key: &str,
        record: &Record,
    ) -> impl Future<Output = Result<(), DurableError>> + Send;

    fn delete(
        &self,
        scope: TableScope<'_>,
        key: &str,
    ) -> impl Future<Output = Result<bool, DurableError>> + Send;

    fn truncate(&self, scope: TableScope<'_>) -> impl Future<Output = Result<u64, DurableError>> + Send;

    /// Replace every row of a table atomically.
    fn replace(
        &self,
        scope: TableScope<'_>,
        rows: &[(RecordKey, Record)],
    ) -> impl Future<Output = Result<(), DurableError>> + Send;
}

/// The configured durable backend.
#[derive(Debug)]
pub enum Durable {
    Memory(MemoryDurableStore),
    Postgres(PgDurableStore),
}

impl Durable {
    pub fn kind(&self) -> &'static str {
        match self {
            Durable::Memory(_) => "memory",
            Durable::Postgres(_) => "postgres",
        }
    }
}

impl DurableStore for Durable {
    async fn list(&self, scope: TableScope<'_>) -> Result<Vec<Record>, DurableError> {
        match self {
            Durable::Memory(store) => store.list(scope).await,
            Durable::Postgres(store) => store.list(scope).await,
        }
    }

    async fn get(&self, scope: TableScope<'_>, key: &str) -> Result<Option<Record>, DurableError> {
        match self {
            Durable::Memory(store) => store.get(scope, key).await,
            Durable::Postgres(store) => store.get(scope, key).await,
        }
    }

    async fn put(&self, scope: TableScope<'_>, key: &str, record: &Record) -> Result<(), DurableError> {
        match self {
            Durable::Memory(store) => store.put(scope, key, record).await,
            Durable::Postgres(store) => store.put(scope, key, record).await,
        }
    }

    async fn delete(&self, scope: TableScope<'_>, key: &str) -> Result<bool, DurableError> {
        match self {
            Durable::Memory(store) => store.delete(scope, key).await,
            Durable::Postgres(store) => store.delete(scope, key).await,
        }
    }

    async fn truncate(&self, scope: TableScope<'_>) -> Result<u64, DurableError> {
        match self {
            Durable::Memory(store) => store.truncate(scope).await,
            Durable::Postgres(store) => store.truncate(scope).await,
        }
    }

    async fn replace(
        &self,
        scope: TableScope<'_>,
        rows: &[(RecordKey, Record)],
    ) -> Result<(), DurableError> {
        match self {
            Durable::Memory(store) => store.replace(scope, rows).await,
            Durable::Postgres(store) => store.replace(scope, rows).await,
        }
    }
}
