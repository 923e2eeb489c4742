//! # POS Sync Engine
//!
//! The record-store and sync core behind the POS sync server.
//!
//! This crate holds the data model and every rule of the sync protocol.
//! It performs no IO: durability, transport and scheduling are layered on
//! top by the server, which keeps these rules testable in isolation.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or databases
//! - **Injected time**: all timestamps come from a [`Clock`]
//! - **All or nothing**: snapshots and mutations validate fully before any
//!   table changes
//!
//! ## Core Concepts
//!
//! ### Module datasets
//!
//! A [`ModuleStore`] holds every table of one (branch, module) pair. Rows
//! are free-form [`Record`]s identified by their table's primary key.
//! Versioned tables carry a per-record `version`; the store itself carries
//! a version that grows by one on every accepted mutation.
//!
//! ### Optimistic concurrency
//!
//! Updates to versioned rows must name the version they expect to write.
//! [`resolve_next_version`] accepts exactly `current + 1` and reports a
//! [`VersionConflict`] otherwise. Direct saves may add
//! [`ConcurrencyGuards`] on business state, staleness and snapshot markers.
//!
//! ### Snapshots and deltas
//!
//! - [`ModuleStore::snapshot`] - full view of a dataset
//! - [`ModuleStore::apply_snapshot`] - insert-only replacement from a client
//! - [`compute_delta`] - rows after each table's cursor, or a full-sync verdict
//!
//! ### Fan-out helpers
//!
//! - [`delta_envelope`] - shallow set/remove diff between two payloads
//! - [`TransactionLedger`] - bounded replay history for transaction ids
//! - [`SequenceRule`] - formatted invoice-style counters
//!
//! ## Quick Start
//!
//! ```rust
//! use pos_sync_engine::{
//!     compute_delta, DeltaRequest, FieldDef, FieldType, ManualClock, ModuleDefinition,
//!     ModuleStore, Schema, TableSchema,
//! };
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new(1)
//!     .with_table(
//!         TableSchema::new(
//!             "order_header",
//!             vec![
//!                 FieldDef::primary("id", FieldType::String),
//!                 FieldDef::optional("status", FieldType::String),
//!             ],
//!         )
//!         .versioned(),
//!     )
//!     .with_module("pos", ModuleDefinition::new(["order_header"]));
//!
//! // 2. Create a store
//! let (_, clock) = ManualClock::shared(1_706_745_600_000);
//! let mut store = ModuleStore::new(&schema, "branch-1", "pos", clock).unwrap();
//!
//! // 3. Mutate
//! let order = json!({"id": "o1", "status": "open"});
//! store.insert("order_header", order.as_object().unwrap()).unwrap();
//! let patch = json!({"id": "o1", "status": "paid", "version": 2});
//! let updated = store.update_record("order_header", patch.as_object().unwrap()).unwrap();
//! assert_eq!(updated["version"], json!(2));
//!
//! // 4. Sync
//! let delta = compute_delta(&store, &DeltaRequest::default()).unwrap();
//! assert_eq!(delta.deltas["order_header"].len(), 1);
//! ```

pub mod clock;
pub mod delta;
pub mod envelope;
pub mod error;
pub mod guard;
pub mod ids;
pub mod ledger;
pub mod record;
pub mod schema;
pub mod sequence;
pub mod snapshot;
pub mod store;
pub mod version;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use delta::{
    compute_delta, compute_insert_only_delta, find_by_cursor, server_snapshot_marker,
    DeltaRequest, DeltaResponse, TableDelta, TableStats,
};
pub use envelope::{delta_envelope, Envelope};
pub use error::{Error, Result};
pub use guard::{evaluate_guards, ConcurrencyGuards, GuardConflict, GuardOutcome};
pub use ids::{IdSource, RandomIds, SequentialIds, SharedIdSource};
pub use ledger::{normalize_trans_id, LedgerLimits, Replay, TransactionLedger};
pub use record::{Record, RecordRef, TableRows};
pub use schema::{FieldDef, FieldType, ModuleDefinition, Schema, TableSchema};
pub use sequence::{SequenceRule, SequenceRules};
pub use snapshot::{validate_insert_only, IncomingSnapshot, InsertOnlyViolation, ModuleSnapshot};
pub use store::{ClearReport, ModuleMeta, ModuleStore, RestoreMode, RestoreReport, SaveOutcome};
pub use version::{resolve_next_version, ConflictReason, VersionConflict};

/// Type aliases for clarity
pub type BranchId = String;
pub type ModuleId = String;
pub type TableName = String;
pub type RecordKey = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
