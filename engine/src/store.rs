//! ModuleStore - the in-memory dataset for one (branch, module).
//!
//! The store owns every table of the module, per-record version counters on
//! versioned tables and a store-level version that grows by one on every
//! accepted mutation. It performs no IO; durability is layered on top.

use crate::{
    clock::SharedClock,
    ids::{RandomIds, SharedIdSource},
    error::Result,
    record::{Record, RecordRef, ResolvedKey, TableRows},
    schema::{InsertContext, Schema, TableSchema},
    snapshot::ModuleSnapshot,
    version::{normalize_version, resolve_next_version, VERSION_FIELD},
    BranchId, Error, ModuleId, RecordKey, TableName, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Bookkeeping carried alongside the dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMeta {
    /// Time of the last accepted mutation (milliseconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<Timestamp>,
    /// Total rows across all tables
    #[serde(default)]
    pub counter: u64,
    /// Saves that replaced an existing row because they carried version 1
    #[serde(default)]
    pub forced_replacements: u64,
    /// Business day closed by the last reset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_closed_date: Option<String>,
    /// Free-form entries (snapshot markers, business date, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome of [`ModuleStore::save`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// The stored row
    pub record: Record,
    /// No row with this key existed before
    pub created: bool,
    /// An existing row was fully replaced (version 1 save)
    pub replaced: bool,
}

/// How [`ModuleStore::restore_tables`] treats existing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Keep existing rows, skip incoming rows whose key exists
    #[default]
    Append,
    /// Drop existing rows first
    Replace,
}

/// Per-table counts from a bulk restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub inserted: BTreeMap<TableName, usize>,
    pub duplicates: BTreeMap<TableName, usize>,
    pub skipped_tables: Vec<TableName>,
}

impl RestoreReport {
    pub fn total_inserted(&self) -> usize {
        self.inserted.values().sum()
    }
}

/// Per-table counts from [`ModuleStore::clear_tables`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub cleared: BTreeMap<TableName, usize>,
    pub skipped_tables: Vec<TableName>,
}

impl ClearReport {
    pub fn total_cleared(&self) -> usize {
        self.cleared.values().sum()
    }
}

/// Copy of some tables plus store version and meta, used to roll back a
/// failed write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreBackup {
    tables: Vec<(TableName, Vec<Record>)>,
    version: Version,
    meta: ModuleMeta,
}

#[derive(Debug, Clone)]
struct Table {
    schema: Arc<TableSchema>,
    rows: Vec<Record>,
}

impl Table {
    fn position(&self, key: &str) -> Option<usize> {
        self.rows.iter().position(|row| {
            self.schema
                .resolve_key(row)
                .is_some_and(|resolved| resolved.key == key)
        })
    }

    fn key_index(&self) -> HashMap<RecordKey, usize> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| self.schema.resolve_key(row).map(|k| (k.key, idx)))
            .collect()
    }
}

/// Give versioned rows loaded in bulk a valid version.
fn initialize_version(schema: &TableSchema, mut row: Record) -> Record {
    if schema.versioned {
        let version = normalize_version(row.get(VERSION_FIELD)).unwrap_or(1);
        row.insert(VERSION_FIELD.to_string(), Value::from(version));
    }
    row
}

fn not_registered(table: &str, module: &str) -> Error {
    Error::TableNotRegistered {
        table: table.to_string(),
        module: module.to_string(),
    }
}

/// The dataset for one (branch, module) pair.
#[derive(Debug, Clone)]
pub struct ModuleStore {
    branch_id: BranchId,
    module_id: ModuleId,
    /// Declared table order
    table_names: Vec<TableName>,
    tables: HashMap<TableName, Table>,
    version: Version,
    meta: ModuleMeta,
    seed: TableRows,
    clock: SharedClock,
    ids: SharedIdSource,
}

impl ModuleStore {
    /// Create an empty store for a module declared in `schema`.
    pub fn new(
        schema: &Schema,
        branch_id: impl Into<BranchId>,
        module_id: impl Into<ModuleId>,
        clock: SharedClock,
    ) -> Result<Self> {
        let module_id = module_id.into();
        let module = schema
            .module(&module_id)
            .ok_or_else(|| Error::ModuleNotFound(module_id.clone()))?;

        let mut tables = HashMap::new();
        for name in &module.tables {
            let table_schema = schema
                .table(name)
                .ok_or_else(|| not_registered(name, &module_id))?;
            tables.insert(
                name.clone(),
                Table {
                    schema: Arc::new(table_schema.clone()),
                    rows: Vec::new(),
                },
            );
        }

        Ok(Self {
            branch_id: branch_id.into(),
            table_names: module.tables.clone(),
            module_id,
            tables,
            version: 1,
            meta: ModuleMeta::default(),
            seed: TableRows::new(),
            clock,
            ids: RandomIds::shared(),
        })
    }

    /// Builder-style method to replace the id source used for keyless inserts.
    pub fn with_id_source(mut self, ids: SharedIdSource) -> Self {
        self.ids = ids;
        self
    }

    /// Builder-style method to install seed rows. The seed is loaded now and
    /// again on every [`reset`](Self::reset).
    pub fn with_seed(mut self, seed: TableRows) -> Result<Self> {
        self.apply_seed(&seed)?;
        self.seed = seed;
        Ok(self)
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    /// Store-level version.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn meta(&self) -> &ModuleMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut ModuleMeta {
        &mut self.meta
    }

    /// Table names in declared order.
    pub fn table_names(&self) -> &[TableName] {
        &self.table_names
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    /// Schema of a module table.
    pub fn table_schema(&self, table: &str) -> Result<&TableSchema> {
        Ok(&self.table(table)?.schema)
    }

    pub fn is_versioned(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|t| t.schema.versioned)
    }

    fn table(&self, table: &str) -> Result<&Table> {
        self.tables
            .get(table)
            .ok_or_else(|| not_registered(table, &self.module_id))
    }

    /// Resolve a record's primary key against the table schema.
    pub fn resolve_key(&self, table: &str, record: &Record) -> Result<Option<ResolvedKey>> {
        Ok(self.table(table)?.schema.resolve_key(record))
    }

    /// Portable reference for a record of `table`.
    pub fn record_reference(&self, table: &str, record: &Record) -> Result<RecordRef> {
        let key = self.resolve_key(table, record)?;
        Ok(RecordRef::new(table, record, key))
    }

    /// Rows of a table, oldest first.
    pub fn rows(&self, table: &str) -> Result<&[Record]> {
        Ok(&self.table(table)?.rows)
    }

    /// Owned copy of a table's rows.
    pub fn list_table(&self, table: &str) -> Result<Vec<Record>> {
        self.rows(table).map(<[Record]>::to_vec)
    }

    /// Get a row by its joined primary key.
    pub fn get(&self, table: &str, key: &str) -> Option<&Record> {
        let table = self.tables.get(table)?;
        table.position(key).map(|idx| &table.rows[idx])
    }

    /// Find the stored row matching the key carried by `criteria`.
    pub fn find(&self, table: &str, criteria: &Record) -> Result<Option<&Record>> {
        let state = self.table(table)?;
        Ok(state
            .schema
            .resolve_key(criteria)
            .and_then(|key| state.position(&key.key))
            .map(|idx| &state.rows[idx]))
    }

    /// Point-in-time copy of the whole dataset.
    pub fn snapshot(&self) -> ModuleSnapshot {
        let tables = self
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.rows.clone()))
            .collect();
        ModuleSnapshot {
            branch_id: self.branch_id.clone(),
            module_id: self.module_id.clone(),
            version: self.version,
            tables,
            meta: self.meta.clone(),
        }
    }

    /// Append a new row. Versioned tables start at version 1. Fails with
    /// [`Error::RecordAlreadyExists`] rather than overwrite.
    ///
    /// A table keyed by a single string field gets a generated id
    /// (`<table>-<unique>`) when the record carries none.
    pub fn insert(&mut self, table: &str, record: &Record) -> Result<Record> {
        let now = self.clock.now_millis();
        let state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| not_registered(table, &self.module_id))?;

        let keyed;
        let record = match state.schema.generated_key_field() {
            Some(field) if state.schema.resolve_key(record).is_none() => {
                let mut filled = record.clone();
                filled.insert(field.to_string(), Value::String(self.ids.next_id(table)));
                keyed = filled;
                &keyed
            }
            _ => record,
        };
        let mut row = state.schema.create_record(
            record,
            InsertContext {
                branch_id: &self.branch_id,
                now,
            },
        )?;
        let key = state.schema.require_key(&row)?;
        if state.position(&key.key).is_some() {
            return Err(Error::RecordAlreadyExists {
                table: table.to_string(),
                key: key.key,
            });
        }
        if state.schema.versioned {
            row.insert(VERSION_FIELD.to_string(), Value::from(1u64));
        }
        state.rows.push(row.clone());

        self.bump(now);
        Ok(row)
    }

    /// Apply a partial update to an existing row.
    ///
    /// Only declared, non-key fields are written; values are coerced per
    /// schema. Versioned tables go through [`resolve_next_version`].
    pub fn update_record(&mut self, table: &str, patch: &Record) -> Result<Record> {
        let now = self.clock.now_millis();
        let state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| not_registered(table, &self.module_id))?;

        let key = state.schema.require_key(patch)?;
        let idx = state.position(&key.key).ok_or_else(|| Error::RecordNotFound {
            table: table.to_string(),
            key: key.key.clone(),
        })?;

        let current = &state.rows[idx];
        let next_version = if state.schema.versioned {
            Some(resolve_next_version(
                table,
                &key.key,
                normalize_version(current.get(VERSION_FIELD)),
                normalize_version(patch.get(VERSION_FIELD)),
            )?)
        } else {
            None
        };

        let mut next = current.clone();
        for field in &state.schema.fields {
            if field.primary_key || field.name == VERSION_FIELD {
                continue;
            }
            if let Some(value) = patch.get(&field.name) {
                next.insert(field.name.clone(), field.coerce(value)?);
            }
        }
        if state.schema.has_field("updatedAt") && !patch.contains_key("updatedAt") {
            next.insert("updatedAt".to_string(), Value::from(now));
        }
        if let Some(version) = next_version {
            next.insert(VERSION_FIELD.to_string(), Value::from(version));
        }
        state.rows[idx] = next.clone();

        self.touch(now);
        self.version += 1;
        Ok(next)
    }

    /// Alias of [`update_record`](Self::update_record) used by `merge` events.
    pub fn merge(&mut self, table: &str, patch: &Record) -> Result<Record> {
        self.update_record(table, patch)
    }

    /// Upsert.
    ///
    /// Unknown or absent keys insert. Existing keys update, except that a
    /// versioned record explicitly carrying `version: 1` replaces the stored
    /// row outright whatever its current version.
    pub fn save(&mut self, table: &str, record: &Record) -> Result<SaveOutcome> {
        let state = self.table(table)?;
        let versioned = state.schema.versioned;
        let existing = state
            .schema
            .resolve_key(record)
            .and_then(|key| state.position(&key.key).map(|idx| (key, idx)));

        let Some((key, idx)) = existing else {
            let record = self.insert(table, record)?;
            return Ok(SaveOutcome {
                record,
                created: true,
                replaced: false,
            });
        };

        if versioned && normalize_version(record.get(VERSION_FIELD)) == Some(1) {
            let record = self.replace_row(table, &key, idx, record)?;
            return Ok(SaveOutcome {
                record,
                created: false,
                replaced: true,
            });
        }

        let record = self.update_record(table, record)?;
        Ok(SaveOutcome {
            record,
            created: false,
            replaced: false,
        })
    }

    fn replace_row(
        &mut self,
        table: &str,
        key: &ResolvedKey,
        idx: usize,
        record: &Record,
    ) -> Result<Record> {
        let now = self.clock.now_millis();
        let state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| not_registered(table, &self.module_id))?;

        let current_version = normalize_version(state.rows[idx].get(VERSION_FIELD)).unwrap_or(1);
        let mut row = state.schema.create_record(
            record,
            InsertContext {
                branch_id: &self.branch_id,
                now,
            },
        )?;
        row.insert(
            VERSION_FIELD.to_string(),
            Value::from(current_version + 1),
        );
        state.rows[idx] = row.clone();

        if current_version > 1 {
            tracing::warn!(
                branch_id = %self.branch_id,
                module_id = %self.module_id,
                table = %table,
                key = %key.key,
                discarded_version = current_version,
                "save with version 1 replaced a newer record"
            );
        } else {
            tracing::debug!(table = %table, key = %key.key, "save with version 1 replaced record");
        }

        self.meta.forced_replacements += 1;
        self.touch(now);
        self.version += 1;
        Ok(row)
    }

    /// Delete the row whose key is carried by `criteria`.
    pub fn remove(&mut self, table: &str, criteria: &Record) -> Result<Record> {
        let now = self.clock.now_millis();
        let state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| not_registered(table, &self.module_id))?;

        let key = state.schema.require_key(criteria)?;
        let idx = state.position(&key.key).ok_or_else(|| Error::RecordNotFound {
            table: table.to_string(),
            key: key.key.clone(),
        })?;
        let removed = state.rows.remove(idx);

        self.version += 1;
        self.touch(now);
        self.recount();
        Ok(removed)
    }

    /// Empty the named tables. Unknown names are reported, not fatal.
    pub fn clear_tables<S: AsRef<str>>(&mut self, names: &[S]) -> ClearReport {
        let mut report = ClearReport::default();
        for name in names {
            let name = name.as_ref();
            match self.tables.get_mut(name) {
                Some(table) => {
                    report.cleared.insert(name.to_string(), table.rows.len());
                    table.rows.clear();
                }
                None => report.skipped_tables.push(name.to_string()),
            }
        }
        if report.total_cleared() > 0 {
            let now = self.clock.now_millis();
            self.version += 1;
            self.touch(now);
            self.recount();
        }
        report
    }

    /// Bulk-load rows into tables.
    ///
    /// Every row must carry a primary key; the call is rejected up front
    /// otherwise. In append mode rows whose key already exists are counted as
    /// duplicates and skipped.
    pub fn restore_tables(&mut self, data: &TableRows, mode: RestoreMode) -> Result<RestoreReport> {
        for (name, rows) in data {
            if let Some(table) = self.tables.get(name) {
                for row in rows {
                    table.schema.require_key(row)?;
                }
            }
        }

        let mut report = RestoreReport::default();
        for (name, rows) in data {
            let Some(table) = self.tables.get_mut(name) else {
                report.skipped_tables.push(name.clone());
                continue;
            };
            if mode == RestoreMode::Replace {
                table.rows.clear();
            }
            let mut seen: HashSet<RecordKey> = table.key_index().into_keys().collect();
            let mut inserted = 0;
            let mut duplicates = 0;
            for row in rows {
                let Some(key) = table.schema.resolve_key(row) else {
                    continue;
                };
                if !seen.insert(key.key) {
                    duplicates += 1;
                    continue;
                }
                table.rows.push(initialize_version(&table.schema, row.clone()));
                inserted += 1;
            }
            report.inserted.insert(name.clone(), inserted);
            report.duplicates.insert(name.clone(), duplicates);
        }

        if report.total_inserted() > 0 || mode == RestoreMode::Replace {
            let now = self.clock.now_millis();
            self.version += 1;
            self.touch(now);
            self.recount();
        }
        Ok(report)
    }

    /// Replace every module table with the rows of an externally supplied
    /// snapshot.
    ///
    /// Incoming rows are keyed by primary key, or by their serialized form
    /// when the key does not resolve; the last row for a key wins. A module
    /// table absent from `tables` ends up empty and tables outside the module
    /// are ignored. The store version becomes the larger of the incoming
    /// version and the current version plus one.
    pub fn replace_tables_from_snapshot(
        &mut self,
        tables: &TableRows,
        incoming_version: Option<Version>,
    ) -> Result<Version> {
        for name in tables.keys().filter(|name| !self.tables.contains_key(*name)) {
            tracing::debug!(table = %name, "ignoring snapshot table outside module");
        }

        for name in &self.table_names {
            let Some(table) = self.tables.get_mut(name) else {
                continue;
            };
            let incoming = tables.get(name).map(Vec::as_slice).unwrap_or_default();
            let mut keyed: Vec<Record> = Vec::with_capacity(incoming.len());
            let mut keyed_index: HashMap<RecordKey, usize> = HashMap::new();
            let mut fallback: Vec<Record> = Vec::new();
            let mut fallback_index: HashMap<String, usize> = HashMap::new();
            for row in incoming {
                let prepared = initialize_version(&table.schema, row.clone());
                let (rows, index, key) = match table.schema.resolve_key(row) {
                    Some(key) => (&mut keyed, &mut keyed_index, key.key),
                    None => (
                        &mut fallback,
                        &mut fallback_index,
                        Value::Object(row.clone()).to_string(),
                    ),
                };
                match index.get(&key) {
                    Some(&idx) => rows[idx] = prepared,
                    None => {
                        index.insert(key, rows.len());
                        rows.push(prepared);
                    }
                }
            }
            keyed.append(&mut fallback);
            table.rows = keyed;
        }

        let now = self.clock.now_millis();
        self.version = incoming_version.unwrap_or(0).max(self.version + 1);
        self.touch(now);
        self.recount();
        Ok(self.version)
    }

    /// Clear every table and load the seed again.
    ///
    /// The store version keeps growing; `closed_day` is recorded as the last
    /// closed business day so clients holding an older marker full-sync.
    pub fn reset(&mut self, closed_day: Option<String>) -> Result<()> {
        for table in self.tables.values_mut() {
            table.rows.clear();
        }
        let seed = std::mem::take(&mut self.seed);
        let seeded = self.apply_seed(&seed);
        self.seed = seed;
        seeded?;

        let now = self.clock.now_millis();
        self.version += 1;
        self.meta.last_closed_date = closed_day;
        self.touch(now);
        Ok(())
    }

    /// Load seed rows into their tables without bumping the version.
    pub fn apply_seed(&mut self, seed: &TableRows) -> Result<()> {
        for (name, rows) in seed {
            let table = self
                .tables
                .get_mut(name)
                .ok_or_else(|| not_registered(name, &self.module_id))?;
            let mut index = table.key_index();
            for row in rows {
                let key = table.schema.require_key(row)?;
                let row = initialize_version(&table.schema, row.clone());
                match index.get(&key.key) {
                    Some(&idx) => table.rows[idx] = row,
                    None => {
                        index.insert(key.key, table.rows.len());
                        table.rows.push(row);
                    }
                }
            }
        }
        self.recount();
        Ok(())
    }

    /// Swap a table's rows wholesale, e.g. after reloading it from durable
    /// storage. Does not bump the version.
    pub fn replace_table_rows(&mut self, table: &str, rows: Vec<Record>) -> Result<()> {
        let state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| not_registered(table, &self.module_id))?;
        state.rows = rows
            .into_iter()
            .map(|row| initialize_version(&state.schema, row))
            .collect();
        self.recount();
        Ok(())
    }

    /// Capture the named tables together with version and meta.
    pub fn backup<S: AsRef<str>>(&self, tables: &[S]) -> StoreBackup {
        StoreBackup {
            tables: tables
                .iter()
                .filter_map(|name| {
                    let name = name.as_ref();
                    self.tables
                        .get(name)
                        .map(|t| (name.to_string(), t.rows.clone()))
                })
                .collect(),
            version: self.version,
            meta: self.meta.clone(),
        }
    }

    /// Roll back to a backup taken with [`backup`](Self::backup).
    pub fn restore_backup(&mut self, backup: StoreBackup) {
        for (name, rows) in backup.tables {
            if let Some(table) = self.tables.get_mut(&name) {
                table.rows = rows;
            }
        }
        self.version = backup.version;
        self.meta = backup.meta;
    }

    fn bump(&mut self, now: Timestamp) {
        self.version += 1;
        self.touch(now);
        self.recount();
    }

    fn touch(&mut self, now: Timestamp) {
        self.meta.last_updated_at = Some(now);
    }

    fn recount(&mut self) {
        self.meta.counter = self.tables.values().map(|t| t.rows.len() as u64).sum();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::SequentialIds;
    use crate::record::into_record;
    use crate::schema::{FieldDef, FieldType, ModuleDefinition};
    use crate::version::{ConflictReason, VersionConflict};
    use serde_json::json;

    pub(crate) fn pos_schema() -> Schema {
        Schema::new(1)
            .with_table(
                TableSchema::new(
                    "order_header",
                    vec![
                        FieldDef::primary("id", FieldType::String),
                        FieldDef::optional("status", FieldType::String),
                        FieldDef::optional("paymentState", FieldType::String),
                        FieldDef::optional("total", FieldType::Float),
                        FieldDef::optional("updatedAt", FieldType::Timestamp),
                    ],
                )
                .versioned(),
            )
            .with_table(
                TableSchema::new(
                    "order_line",
                    vec![
                        FieldDef::primary("orderId", FieldType::String),
                        FieldDef::primary("lineNo", FieldType::Int),
                        FieldDef::optional("qty", FieldType::Float),
                    ],
                )
                .versioned(),
            )
            .with_table(TableSchema::new(
                "settings",
                vec![
                    FieldDef::primary("id", FieldType::String),
                    FieldDef::optional("value", FieldType::Json),
                ],
            ))
            .with_module(
                "pos",
                ModuleDefinition::new(["order_header", "order_line", "settings"]),
            )
    }

    pub(crate) fn test_store() -> ModuleStore {
        let (_, clock) = ManualClock::shared(1_706_745_600_000);
        ModuleStore::new(&pos_schema(), "b1", "pos", clock).unwrap()
    }

    pub(crate) fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    #[test]
    fn create_store() {
        let store = test_store();
        assert_eq!(store.branch_id(), "b1");
        assert_eq!(store.module_id(), "pos");
        assert_eq!(store.version(), 1);
        assert_eq!(store.table_names().len(), 3);
        assert!(store.is_versioned("order_header"));
        assert!(!store.is_versioned("settings"));
    }

    #[test]
    fn unknown_module_rejected() {
        let (_, clock) = ManualClock::shared(0);
        let result = ModuleStore::new(&pos_schema(), "b1", "kds", clock);
        assert!(matches!(result, Err(Error::ModuleNotFound(m)) if m == "kds"));
    }

    #[test]
    fn insert_assigns_version_one() {
        let mut store = test_store();
        let row = store
            .insert("order_header", &rec(json!({"id": "o1", "status": "open"})))
            .unwrap();
        assert_eq!(row["version"], json!(1));
        assert_eq!(store.version(), 2);
        assert_eq!(store.meta().counter, 1);
        assert_eq!(store.meta().last_updated_at, Some(1_706_745_600_000));
    }

    #[test]
    fn insert_duplicate_rejected() {
        let mut store = test_store();
        store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();
        let result = store.insert("order_header", &rec(json!({"id": "o1"})));
        assert!(matches!(result, Err(Error::RecordAlreadyExists { key, .. }) if key == "o1"));
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn insert_unregistered_table() {
        let mut store = test_store();
        let result = store.insert("ghost", &rec(json!({"id": "x"})));
        assert!(matches!(result, Err(Error::TableNotRegistered { table, .. }) if table == "ghost"));
    }

    #[test]
    fn update_requires_key_and_existing_row() {
        let mut store = test_store();
        let result = store.update_record("order_header", &rec(json!({"status": "paid"})));
        assert!(matches!(result, Err(Error::MissingPrimaryKey { .. })));

        let result = store.update_record("order_header", &rec(json!({"id": "nope", "version": 2})));
        assert!(matches!(result, Err(Error::RecordNotFound { key, .. }) if key == "nope"));
    }

    #[test]
    fn update_ignores_unknown_fields_and_keeps_identity() {
        let mut store = test_store();
        store
            .insert("order_header", &rec(json!({"id": "o1", "status": "open"})))
            .unwrap();
        let row = store
            .update_record(
                "order_header",
                &rec(json!({"id": "o1", "status": "paid", "total": "12.5", "bogus": 1, "version": 2})),
            )
            .unwrap();
        assert_eq!(row["status"], json!("paid"));
        assert_eq!(row["total"], json!(12.5));
        assert_eq!(row["version"], json!(2));
        assert!(row.get("bogus").is_none());
        assert_eq!(row["updatedAt"], json!(1_706_745_600_000u64));
    }

    #[test]
    fn update_version_conflicts() {
        let mut store = test_store();
        store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();

        let missing = store
            .update_record("order_header", &rec(json!({"id": "o1", "status": "x"})))
            .unwrap_err();
        assert!(matches!(
            missing,
            Error::VersionConflict(VersionConflict {
                reason: ConflictReason::MissingVersion,
                ..
            })
        ));

        store
            .update_record("order_header", &rec(json!({"id": "o1", "version": 2})))
            .unwrap();
        let stale = store
            .update_record("order_header", &rec(json!({"id": "o1", "version": 2})))
            .unwrap_err();
        match stale {
            Error::VersionConflict(conflict) => {
                assert_eq!(conflict.reason, ConflictReason::StaleVersion);
                assert_eq!(conflict.expected_version, Some(2));
                assert_eq!(conflict.current_version, 2);
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[test]
    fn non_versioned_update_skips_version_check() {
        let mut store = test_store();
        store
            .insert("settings", &rec(json!({"id": "tax", "value": 0.1})))
            .unwrap();
        let row = store
            .update_record("settings", &rec(json!({"id": "tax", "value": 0.2})))
            .unwrap();
        assert_eq!(row["value"], json!(0.2));
        assert!(row.get("version").is_none());
    }

    #[test]
    fn save_inserts_then_updates() {
        let mut store = test_store();
        let first = store
            .save("order_header", &rec(json!({"id": "o1", "status": "open"})))
            .unwrap();
        assert!(first.created);

        let second = store
            .save(
                "order_header",
                &rec(json!({"id": "o1", "status": "paid", "version": 2})),
            )
            .unwrap();
        assert!(!second.created && !second.replaced);
        assert_eq!(second.record["version"], json!(2));
    }

    #[test]
    fn save_without_key_appends_generated_id() {
        let mut store = test_store().with_id_source(SequentialIds::shared());
        store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();

        let outcome = store
            .save("order_header", &rec(json!({"status": "open"})))
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.record["id"], json!("order_header-1"));
        assert_eq!(outcome.record["version"], json!(1));

        let rows = store.rows("order_header").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["status"], json!("open"));
        assert_eq!(store.version(), 3);
    }

    #[test]
    fn composite_key_is_never_generated() {
        let mut store = test_store().with_id_source(SequentialIds::shared());
        let result = store.save("order_line", &rec(json!({"qty": 1})));
        assert!(result.is_err());
        assert!(store.rows("order_line").unwrap().is_empty());
    }

    #[test]
    fn save_version_one_replaces_existing_row() {
        let mut store = test_store();
        store
            .insert("order_header", &rec(json!({"id": "o1", "status": "open", "total": 5})))
            .unwrap();
        store
            .update_record("order_header", &rec(json!({"id": "o1", "version": 2})))
            .unwrap();
        store
            .update_record("order_header", &rec(json!({"id": "o1", "version": 3})))
            .unwrap();

        let outcome = store
            .save("order_header", &rec(json!({"id": "o1", "status": "new", "version": 1})))
            .unwrap();
        assert!(outcome.replaced);
        assert_eq!(outcome.record["status"], json!("new"));
        assert!(outcome.record.get("total").is_none());
        assert_eq!(outcome.record["version"], json!(4));
        assert_eq!(store.meta().forced_replacements, 1);
        assert_eq!(store.rows("order_header").unwrap().len(), 1);
    }

    #[test]
    fn remove_row() {
        let mut store = test_store();
        store.insert("settings", &rec(json!({"id": "a"}))).unwrap();
        store.insert("settings", &rec(json!({"id": "b"}))).unwrap();
        let removed = store.remove("settings", &rec(json!({"id": "a"}))).unwrap();
        assert_eq!(removed["id"], json!("a"));
        assert_eq!(store.meta().counter, 1);
        assert_eq!(store.version(), 4);

        let result = store.remove("settings", &rec(json!({"id": "a"})));
        assert!(matches!(result, Err(Error::RecordNotFound { .. })));
    }

    #[test]
    fn clear_tables_reports_counts() {
        let mut store = test_store();
        store.insert("settings", &rec(json!({"id": "a"}))).unwrap();
        let version = store.version();
        let report = store.clear_tables(&["settings", "ghost"]);
        assert_eq!(report.cleared.get("settings"), Some(&1));
        assert_eq!(report.skipped_tables, vec!["ghost".to_string()]);
        assert_eq!(store.version(), version + 1);

        let again = store.clear_tables(&["settings"]);
        assert_eq!(again.total_cleared(), 0);
        assert_eq!(store.version(), version + 1);
    }

    #[test]
    fn restore_append_counts_duplicates() {
        let mut store = test_store();
        store.insert("settings", &rec(json!({"id": "a"}))).unwrap();
        let data = TableRows::from([(
            "settings".to_string(),
            vec![rec(json!({"id": "a"})), rec(json!({"id": "b"})), rec(json!({"id": "b"}))],
        )]);
        let report = store.restore_tables(&data, RestoreMode::Append).unwrap();
        assert_eq!(report.inserted.get("settings"), Some(&1));
        assert_eq!(report.duplicates.get("settings"), Some(&2));
        assert_eq!(store.rows("settings").unwrap().len(), 2);
    }

    #[test]
    fn restore_replace_discards_existing() {
        let mut store = test_store();
        store.insert("settings", &rec(json!({"id": "a"}))).unwrap();
        let data = TableRows::from([("settings".to_string(), vec![rec(json!({"id": "z"}))])]);
        store.restore_tables(&data, RestoreMode::Replace).unwrap();
        let rows = store.rows("settings").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("z"));
    }

    #[test]
    fn restore_rejects_keyless_rows_up_front() {
        let mut store = test_store();
        let data = TableRows::from([(
            "settings".to_string(),
            vec![rec(json!({"id": "a"})), rec(json!({"value": 1}))],
        )]);
        assert!(store.restore_tables(&data, RestoreMode::Append).is_err());
        assert!(store.rows("settings").unwrap().is_empty());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn snapshot_replaces_rows_and_last_duplicate_wins() {
        let mut store = test_store();
        store
            .insert("order_header", &rec(json!({"id": "o1", "status": "open"})))
            .unwrap();
        let tables = TableRows::from([(
            "order_header".to_string(),
            vec![
                rec(json!({"id": "o1", "status": "paid", "version": 3})),
                rec(json!({"id": "o2", "status": "open"})),
                rec(json!({"id": "o2", "status": "void"})),
            ],
        )]);
        let version = store.replace_tables_from_snapshot(&tables, Some(10)).unwrap();
        assert_eq!(version, 10);
        let rows = store.rows("order_header").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["status"], json!("paid"));
        assert_eq!(rows[0]["version"], json!(3));
        assert_eq!(rows[1]["status"], json!("void"));
        assert_eq!(rows[1]["version"], json!(1));
        assert_eq!(store.meta().counter, 2);
    }

    #[test]
    fn snapshot_drops_rows_it_leaves_out() {
        let mut store = test_store();
        store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();
        store.insert("order_header", &rec(json!({"id": "o2"}))).unwrap();
        store.insert("settings", &rec(json!({"id": "tax"}))).unwrap();
        let tables = TableRows::from([
            ("order_header".to_string(), vec![rec(json!({"id": "o1"}))]),
            ("order_line".to_string(), Vec::new()),
            ("settings".to_string(), Vec::new()),
        ]);
        store.replace_tables_from_snapshot(&tables, Some(10)).unwrap();
        let ids: Vec<_> = store
            .rows("order_header")
            .unwrap()
            .iter()
            .map(|row| row["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("o1")]);
        assert!(store.rows("settings").unwrap().is_empty());
        assert_eq!(store.meta().counter, 1);
    }

    #[test]
    fn snapshot_keeps_keyless_rows_by_content() {
        let mut store = test_store();
        let tables = TableRows::from([(
            "settings".to_string(),
            vec![
                rec(json!({"label": "a"})),
                rec(json!({"label": "a"})),
                rec(json!({"id": "tax"})),
            ],
        )]);
        store.replace_tables_from_snapshot(&tables, None).unwrap();
        let rows = store.rows("settings").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!("tax"));
        assert_eq!(rows[1]["label"], json!("a"));
    }

    #[test]
    fn snapshot_never_regresses_version() {
        let mut store = test_store();
        store.insert("settings", &rec(json!({"id": "a"}))).unwrap();
        let version = store
            .replace_tables_from_snapshot(&TableRows::new(), Some(1))
            .unwrap();
        assert_eq!(version, 3);
        assert_eq!(store.meta().counter, 0);
    }

    #[test]
    fn reset_reseeds_and_keeps_version_growing() {
        let seed = TableRows::from([("settings".to_string(), vec![rec(json!({"id": "tax"}))])]);
        let mut store = test_store().with_seed(seed).unwrap();
        assert_eq!(store.rows("settings").unwrap().len(), 1);

        store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();
        let before = store.version();
        store.reset(Some("2024-02-01".into())).unwrap();

        assert!(store.rows("order_header").unwrap().is_empty());
        assert_eq!(store.rows("settings").unwrap().len(), 1);
        assert!(store.version() > before);
        assert_eq!(store.meta().last_closed_date.as_deref(), Some("2024-02-01"));
    }

    #[test]
    fn backup_and_restore() {
        let mut store = test_store();
        store.insert("settings", &rec(json!({"id": "a"}))).unwrap();
        let backup = store.backup(&["settings"]);
        store.insert("settings", &rec(json!({"id": "b"}))).unwrap();
        store.restore_backup(backup);
        assert_eq!(store.rows("settings").unwrap().len(), 1);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn record_reference_for_composite_key() {
        let store = test_store();
        let reference = store
            .record_reference("order_line", &rec(json!({"orderId": "o1", "lineNo": 2})))
            .unwrap();
        assert_eq!(reference.key.as_deref(), Some("o1::2"));
        assert_eq!(reference.primary_key.len(), 2);
    }
    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_version_increments_by_one(updates in 1usize..40) {
                let mut store = test_store();
                store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();

                for step in 0..updates {
                    let expected = step as u64 + 2;
                    let row = store
                        .update_record(
                            "order_header",
                            &rec(json!({"id": "o1", "status": format!("s{step}"), "version": expected})),
                        )
                        .unwrap();
                    prop_assert_eq!(row[VERSION_FIELD].as_u64(), Some(expected));
                }
                prop_assert_eq!(store.version(), updates as u64 + 2);
            }

            #[test]
            fn prop_stale_version_always_rejected(updates in 1u64..20, stale in 0u64..20) {
                let mut store = test_store();
                store.insert("order_header", &rec(json!({"id": "o1"}))).unwrap();
                for version in 2..=updates + 1 {
                    store
                        .update_record("order_header", &rec(json!({"id": "o1", "version": version})))
                        .unwrap();
                }
                let current = updates + 1;
                prop_assume!(stale != current + 1 && stale != 0);

                let before = store.version();
                let result = store.update_record(
                    "order_header",
                    &rec(json!({"id": "o1", "status": "late", "version": stale})),
                );
                prop_assert!(matches!(result, Err(Error::VersionConflict(_))));
                prop_assert_eq!(store.version(), before);
            }
        }
    }
}
