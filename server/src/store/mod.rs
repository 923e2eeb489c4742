//! Module datasets backed by durable storage.
//!
//! A [`HybridStore`] keeps the engine's in-memory [`ModuleStore`] coherent
//! with the durable copy of its persisted tables. The [`ModuleRegistry`]
//! hands out one lock-guarded store per (branch, module).
//!
//! [`ModuleStore`]: pos_sync_engine::ModuleStore

mod hybrid;
mod registry;

pub use hybrid::HybridStore;
pub use registry::ModuleRegistry;

use crate::db::DurableError;

/// Errors from a write-through dataset.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Engine(#[from] pos_sync_engine::Error),

    #[error(transparent)]
    Durable(#[from] DurableError),
}

impl From<StoreError> for crate::error::AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Engine(e) => Self::Engine(e),
            StoreError::Durable(e) => Self::Durable(e),
        }
    }
}
