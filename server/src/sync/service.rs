//! The sync service: every flow that touches a module dataset and then fans
//! the change out to connected clients.
//!
//! Each flow locks the dataset, applies its change, publishes the new sync
//! payload and broadcasts the event before releasing the lock, so the
//! broadcasts of one dataset leave in the order its changes were accepted.

use std::sync::Arc;

use pos_sync_engine::{
    clock::{business_day, to_rfc3339},
    compute_delta, evaluate_guards, normalize_trans_id, ConcurrencyGuards, DeltaRequest,
    DeltaResponse, Envelope, Error as EngineError, IncomingSnapshot, ModuleSnapshot, Record,
    RecordRef, RestoreMode, Schema, SequenceRules, SharedClock, TableName, TableRows, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::dedup::LedgerRegistry;
use super::flags::{FlagRequest, FullSyncFlag, FullSyncRegistry};
use super::history::{PurgeEntry, PurgeHistory};
use super::pubsub::{dataset_topics, parse_sync_topic, table_topics, TopicRegistry};
use super::sequence::SequenceAllocator;
use super::state::SyncStateCache;
use crate::config::Config;
use crate::db::{Durable, DurableStore};
use crate::error::{AppError, Result};
use crate::schema::{resolve_table_alias, POS_MODULE, TRANSACTION_TABLES};
use crate::store::{HybridStore, ModuleRegistry};
use crate::websocket::{ConnectionManager, Directive, ServerMessage, SyncEvent, TableNotice};

const FULL_SYNC_DIRECTIVE: &str = "full-sync-flag";

/// A row-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Insert,
    Merge,
    Save,
    Delete,
}

impl MutationAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action.trim() {
            "module:insert" => Some(Self::Insert),
            "module:merge" | "module:update" => Some(Self::Merge),
            "module:save" => Some(Self::Save),
            "module:delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A mutation as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub action: MutationAction,
    pub table: TableName,
    pub record: Record,
    pub guards: ConcurrencyGuards,
    pub snapshot_marker: Option<String>,
}

impl Mutation {
    /// Read a mutation out of a publish frame's `data`.
    pub fn from_data(data: &Value) -> Result<Self> {
        let action = data
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("module:save");
        let action = MutationAction::parse(action)
            .ok_or_else(|| AppError::BadRequest(format!("unsupported action {action}")))?;
        let table = data
            .get("table")
            .or_else(|| data.get("tableName"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::BadRequest("table is required".into()))?;
        let record = data
            .get("record")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| AppError::BadRequest("record must be an object".into()))?;
        let guards = match data.get("concurrencyGuards") {
            Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())
                .map_err(|e| AppError::BadRequest(format!("invalid concurrencyGuards: {e}")))?,
            _ => ConcurrencyGuards::default(),
        };
        Ok(Self {
            action,
            table: table.to_string(),
            record,
            guards,
            snapshot_marker: data
                .get("snapshotMarker")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// A change a client submits under an optional transaction id.
#[derive(Debug, Clone)]
pub enum Submission {
    Mutation(Mutation),
    Snapshot(IncomingSnapshot),
}

/// Outcome of [`SyncService::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub result: Value,
    /// Answered from the transaction ledger without touching the dataset
    pub duplicate: bool,
    pub previous_mutation_id: Option<String>,
    pub acked_mutation_id: Option<String>,
}

/// Delta response plus the server's own full-sync view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaReply {
    #[serde(flatten)]
    pub delta: DeltaResponse,
    pub full_sync_flags: Vec<FullSyncFlag>,
    pub full_sync_required: bool,
    pub server_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    pub branch_id: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub flag_full_sync: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub purge: PurgeEntry,
    pub total_cleared: usize,
    pub skipped_tables: Vec<TableName>,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_sync_flag: Option<FullSyncFlag>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub branch_id: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(alias = "id")]
    pub purge_id: String,
    #[serde(default)]
    pub mode: RestoreMode,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub branch_id: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub flag_full_sync: Option<bool>,
}

/// What a broadcast announces.
struct Change<'a> {
    action: &'a str,
    table: Option<&'a str>,
    row: Option<&'a Record>,
    mutation_id: Option<&'a str>,
    /// Tables whose topic subscribers get a row-level notice
    notice_tables: &'a [TableName],
}

/// Identity of a broadcast event.
struct Announced {
    event_id: String,
    sequence: u64,
    version: Version,
    record_ref: Option<RecordRef>,
}

fn module_or_default(module_id: Option<&str>) -> String {
    module_id
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(POS_MODULE)
        .to_string()
}

fn require_branch(branch_id: &str) -> Result<&str> {
    let branch_id = branch_id.trim();
    if branch_id.is_empty() {
        return Err(AppError::BadRequest("branchId is required".into()));
    }
    Ok(branch_id)
}

/// Canonical, de-duplicated table names.
fn resolve_tables(requested: Option<&[String]>) -> Vec<TableName> {
    let mut tables: Vec<TableName> = Vec::new();
    let candidates: Vec<String> = match requested {
        Some(list) if !list.is_empty() => list.iter().filter_map(|t| resolve_table_alias(t)).collect(),
        _ => TRANSACTION_TABLES.iter().map(|t| t.to_string()).collect(),
    };
    for table in candidates {
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}

/// Shared state of one server instance.
#[derive(Debug)]
pub struct SyncService<D = Durable> {
    config: Arc<Config>,
    registry: ModuleRegistry<D>,
    states: SyncStateCache,
    flags: FullSyncRegistry,
    ledgers: LedgerRegistry,
    topics: TopicRegistry,
    history: PurgeHistory,
    sequences: SequenceAllocator<D>,
    connections: Arc<ConnectionManager>,
    clock: SharedClock,
}

impl<D: DurableStore> SyncService<D> {
    pub fn new(
        config: Arc<Config>,
        schema: Arc<Schema>,
        rules: SequenceRules,
        durable: Arc<D>,
        connections: Arc<ConnectionManager>,
        clock: SharedClock,
    ) -> Self {
        let registry = ModuleRegistry::new(
            schema,
            durable.clone(),
            clock.clone(),
            config.persisted_tables.clone(),
            config.hybrid_cache_ttl_ms,
        );
        Self {
            registry,
            states: SyncStateCache::new(config.sync_state_limit),
            flags: FullSyncRegistry::new(clock.clone()),
            ledgers: LedgerRegistry::new(config.ledger_limits()),
            topics: TopicRegistry::new(),
            history: PurgeHistory::new(),
            sequences: SequenceAllocator::new(durable, rules),
            connections,
            clock,
            config,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &ModuleRegistry<D> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Payloads and fan-out
    // ------------------------------------------------------------------

    fn build_payload(&self, action: &str, snapshot: &ModuleSnapshot, mutation_id: Option<&str>) -> Value {
        let flags = self.flags.active(&snapshot.branch_id, &snapshot.module_id);
        let mut meta = json!({
            "branchId": snapshot.branch_id,
            "moduleId": snapshot.module_id,
            "serverId": self.config.server_id,
            "version": snapshot.version,
            "updatedAt": snapshot.meta.last_updated_at.map(to_rfc3339),
        });
        if !flags.is_empty() {
            meta["fullSyncRequired"] = Value::Bool(true);
            meta["fullSyncFlags"] = json!(flags);
        }
        json!({
            "action": action,
            "branchId": snapshot.branch_id,
            "moduleId": snapshot.module_id,
            "version": snapshot.version,
            "snapshot": snapshot,
            "mutationId": mutation_id,
            "meta": meta,
        })
    }

    /// Cache `payload` as the dataset's sync state and publish it on the
    /// dataset topics.
    fn publish_state(&self, branch_id: &str, module_id: &str, payload: Value) {
        self.states.put(branch_id, module_id, payload.clone());
        for topic in dataset_topics(branch_id, module_id) {
            let Some(publication) = self.topics.publish(&topic, payload.clone()) else {
                continue;
            };
            if publication.subscribers.is_empty() {
                continue;
            }
            let message = ServerMessage::Publish {
                topic,
                data: publication.envelope,
            };
            self.connections.send_to_many(&publication.subscribers, &message);
        }
    }

    /// Publish the dataset's new state, broadcast the event to the branch
    /// and notify table topic subscribers.
    fn announce(&self, dataset: &mut HybridStore<D>, change: Change<'_>) -> Result<Announced> {
        let store = dataset.store();
        let branch_id = store.branch_id().clone();
        let module_id = store.module_id().clone();
        let version = store.version();
        let record_ref = match (change.table, change.row) {
            (Some(table), Some(row)) => Some(store.record_reference(table, row)?),
            _ => None,
        };
        let payload = self.build_payload(change.action, &store.snapshot(), change.mutation_id);
        let sequence = dataset.next_event_sequence();
        let event_id = uuid::Uuid::new_v4().to_string();

        let meta = payload.get("meta").cloned().unwrap_or(Value::Null);
        self.publish_state(&branch_id, &module_id, payload);

        let notice = |table: &str| TableNotice {
            action: change.action.to_string(),
            branch_id: branch_id.clone(),
            module_id: module_id.clone(),
            table: table.to_string(),
            version,
            record_ref: record_ref.clone().filter(|r| r.table == table),
            event_id: event_id.clone(),
        };

        let event = SyncEvent {
            action: change.action.to_string(),
            branch_id: branch_id.clone(),
            module_id: module_id.clone(),
            version,
            table: change.table.map(str::to_string),
            record_ref: record_ref.clone(),
            event_id: event_id.clone(),
            sequence,
            meta,
            entry: change.row.map(|row| Value::Object(row.clone())),
            notice: change.table.map(notice),
        };
        let recipients = self
            .connections
            .broadcast_branch(&branch_id, &ServerMessage::Event(event));

        let mut notice_tables: Vec<&str> = change.notice_tables.iter().map(String::as_str).collect();
        if let Some(table) = change.table {
            if !notice_tables.contains(&table) {
                notice_tables.push(table);
            }
        }
        for table in notice_tables {
            let message = ServerMessage::TableUpdate(notice(table));
            for topic in table_topics(&branch_id, &module_id, table) {
                let subscribers = self.topics.subscribers(&topic);
                if !subscribers.is_empty() {
                    self.connections.send_to_many(&subscribers, &message);
                }
            }
        }

        tracing::debug!(
            branch_id = %branch_id,
            module_id = %module_id,
            action = %change.action,
            version,
            sequence,
            recipients,
            "announced change"
        );
        Ok(Announced {
            event_id,
            sequence,
            version,
            record_ref,
        })
    }

    fn raise_flag(&self, request: FlagRequest) -> FullSyncFlag {
        let flag = self.flags.upsert(request);
        self.send_directive(&flag);
        flag
    }

    fn send_directive(&self, flag: &FullSyncFlag) {
        let message = ServerMessage::Directive(Directive {
            directive: FULL_SYNC_DIRECTIVE.to_string(),
            flag: flag.clone(),
        });
        self.connections.broadcast_branch(&flag.branch_id, &message);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current sync payload of a dataset.
    pub async fn snapshot(&self, branch_id: &str, module_id: &str) -> Result<Value> {
        let shared = self.registry.get(branch_id, module_id)?;
        let mut dataset = shared.lock().await;
        let snapshot = dataset.snapshot().await?;
        let payload = self.build_payload("module:snapshot", &snapshot, None);
        self.states.put(branch_id, module_id, payload.clone());
        Ok(payload)
    }

    /// Insert-only delta against the live dataset. Any active full-sync
    /// flag forces `requiresFullSync`.
    pub async fn delta(&self, branch_id: &str, module_id: &str, request: &DeltaRequest) -> Result<DeltaReply> {
        let shared = self.registry.get(branch_id, module_id)?;
        let mut dataset = shared.lock().await;
        let mut delta = compute_delta(dataset.read().await?, request)?;

        let flags = self.flags.active(branch_id, module_id);
        let full_sync_required = !flags.is_empty();
        if full_sync_required {
            delta.requires_full_sync = true;
        }
        Ok(DeltaReply {
            delta,
            full_sync_flags: flags,
            full_sync_required,
            server_id: self.config.server_id.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Apply a mutation or snapshot. A transaction id seen before is
    /// answered from the ledger with the original result.
    pub async fn submit(
        &self,
        branch_id: &str,
        module_id: &str,
        submission: Submission,
        trans_id: Option<&str>,
        mutation_id: Option<&str>,
    ) -> Result<Accepted> {
        let shared = self.registry.get(branch_id, module_id)?;
        let mut dataset = shared.lock().await;

        if let Some(trans_id) = trans_id {
            if let Some(replay) = self.ledgers.replay(branch_id, module_id, trans_id, mutation_id) {
                tracing::info!(
                    branch_id = %branch_id,
                    module_id = %module_id,
                    trans_id = %trans_id,
                    "duplicate transaction answered from ledger"
                );
                return Ok(Accepted {
                    result: replay.payload,
                    duplicate: true,
                    previous_mutation_id: replay.previous_mutation_id,
                    acked_mutation_id: replay.acked_mutation_id,
                });
            }
        }

        let result = match submission {
            Submission::Mutation(mutation) => {
                self.apply_mutation(&mut dataset, branch_id, module_id, mutation, mutation_id)
                    .await?
            }
            Submission::Snapshot(incoming) => {
                self.apply_snapshot(&mut dataset, &incoming, mutation_id).await?
            }
        };

        if let Some(trans_id) = trans_id {
            self.ledgers.remember(
                branch_id,
                module_id,
                trans_id,
                result.clone(),
                mutation_id,
                self.clock.now_millis(),
            );
        }
        Ok(Accepted {
            result,
            duplicate: false,
            previous_mutation_id: None,
            acked_mutation_id: mutation_id.map(str::to_string),
        })
    }

    async fn apply_mutation(
        &self,
        dataset: &mut HybridStore<D>,
        branch_id: &str,
        module_id: &str,
        mutation: Mutation,
        mutation_id: Option<&str>,
    ) -> Result<Value> {
        let Mutation {
            action,
            table,
            mut record,
            guards,
            snapshot_marker,
        } = mutation;

        if !guards.is_empty() || snapshot_marker.is_some() {
            let store = dataset.read().await?;
            let outcome = evaluate_guards(store, &table, &record, &guards, snapshot_marker.as_deref())?;
            if let Some(conflict) = outcome.conflict {
                tracing::warn!(
                    branch_id = %branch_id,
                    module_id = %module_id,
                    table = %table,
                    code = conflict.code(),
                    "concurrency guard rejected mutation"
                );
                return Err(EngineError::ConcurrencyGuardFailed(conflict).into());
            }
        }

        let allocate = match action {
            MutationAction::Insert => true,
            MutationAction::Save => dataset.read().await?.find(&table, &record)?.is_none(),
            MutationAction::Merge | MutationAction::Delete => false,
        };
        if allocate {
            self.sequences
                .apply(branch_id, module_id, &table, &mut record)
                .await?;
        }

        let (effective, row) = match action {
            MutationAction::Insert => ("module:insert", dataset.insert(&table, &record).await?),
            MutationAction::Merge => ("module:merge", dataset.merge(&table, &record).await?),
            MutationAction::Save => {
                let outcome = dataset.save(&table, &record).await?;
                let effective = if outcome.created { "module:insert" } else { "module:merge" };
                (effective, outcome.record)
            }
            MutationAction::Delete => ("module:delete", dataset.remove(&table, &record).await?),
        };

        let announced = self.announce(
            dataset,
            Change {
                action: effective,
                table: Some(&table),
                row: Some(&row),
                mutation_id,
                notice_tables: &[],
            },
        )?;
        Ok(json!({
            "action": effective,
            "table": table,
            "record": row,
            "recordRef": announced.record_ref,
            "version": announced.version,
            "eventId": announced.event_id,
            "sequence": announced.sequence,
        }))
    }

    async fn apply_snapshot(
        &self,
        dataset: &mut HybridStore<D>,
        incoming: &IncomingSnapshot,
        mutation_id: Option<&str>,
    ) -> Result<Value> {
        let version = dataset.apply_snapshot(incoming).await?;
        let tables = dataset.store().table_names().to_vec();
        let announced = self.announce(
            dataset,
            Change {
                action: "module:snapshot",
                table: None,
                row: None,
                mutation_id,
                notice_tables: &tables,
            },
        )?;
        Ok(json!({
            "action": "module:snapshot",
            "version": version,
            "eventId": announced.event_id,
            "sequence": announced.sequence,
        }))
    }

    // ------------------------------------------------------------------
    // WebSocket flows
    // ------------------------------------------------------------------

    /// Bind a connection to a branch and build its initial snapshot frame.
    pub async fn hello(&self, conn_id: &str, branch_id: &str, role: Option<String>) -> Result<ServerMessage> {
        let branch_id = require_branch(branch_id)?;
        self.connections.bind(conn_id, branch_id, role);

        let mut modules = Map::new();
        for module_id in self.registry.module_ids() {
            let payload = self.snapshot(branch_id, &module_id).await?;
            modules.insert(module_id, payload);
        }
        Ok(ServerMessage::Snapshot {
            branch_id: branch_id.to_string(),
            modules,
            full_sync_flags: self.flags.list(Some(branch_id), None, false),
            meta: json!({
                "serverId": self.config.server_id,
                "generatedAt": to_rfc3339(self.clock.now_millis()),
            }),
        })
    }

    /// Join a topic. Returns the bootstrap frame: the retained payload, or
    /// for a sync topic without one, the dataset's sync state.
    pub async fn subscribe(&self, conn_id: &str, topic: &str) -> Result<Option<ServerMessage>> {
        let retained = self.topics.subscribe(topic, conn_id);
        let data = match (retained, parse_sync_topic(topic)) {
            (Some(data), _) => Some(data),
            (None, Some((branch_id, module_id))) => {
                let payload = match self.states.get(&branch_id, &module_id) {
                    Some(payload) => payload,
                    None => self.snapshot(&branch_id, &module_id).await?,
                };
                self.topics.retain(topic, payload.clone());
                Some(payload)
            }
            (None, None) => None,
        };
        tracing::debug!(conn_id = %conn_id, topic = %topic, bootstrap = data.is_some(), "subscribed");
        Ok(data.map(|data| ServerMessage::Publish {
            topic: topic.to_string(),
            data: Envelope::snapshot(data),
        }))
    }

    pub fn unsubscribe(&self, conn_id: &str, topic: &str) {
        self.topics.unsubscribe(topic, conn_id);
    }

    /// Handle a publish frame; returns the frame owed to the publisher.
    pub async fn publish(
        &self,
        conn_id: &str,
        topic: &str,
        data: Value,
        trans_id: Option<Value>,
    ) -> Option<ServerMessage> {
        let Some((branch_id, module_id)) = parse_sync_topic(topic) else {
            self.relay(conn_id, topic, data);
            return None;
        };

        let trans_id = trans_id
            .as_ref()
            .or_else(|| data.get("transId"))
            .and_then(normalize_trans_id);
        let Some(trans_id) = trans_id else {
            return Some(ServerMessage::error(
                "missing-trans-id",
                "publish on a sync topic requires a transId",
                Some(topic.to_string()),
            ));
        };
        let mutation_id = data.get("mutationId").and_then(normalize_trans_id);

        let submission = match data.get("snapshot") {
            Some(snapshot) if !snapshot.is_null() => {
                IncomingSnapshot::from_value(snapshot).map(Submission::Snapshot).map_err(AppError::from)
            }
            _ => Mutation::from_data(&data).map(Submission::Mutation),
        };
        let accepted = match submission {
            Ok(submission) => {
                self.submit(&branch_id, &module_id, submission, Some(&trans_id), mutation_id.as_deref())
                    .await
            }
            Err(err) => Err(err),
        };

        match accepted {
            Ok(accepted) => Some(ServerMessage::Ack {
                topic: topic.to_string(),
                trans_id: Some(trans_id),
                mutation_id,
                duplicate_trans: accepted.duplicate,
                previous_mutation_id: accepted.previous_mutation_id,
                acked_mutation_id: accepted.acked_mutation_id,
                result: accepted.result,
            }),
            Err(err) => {
                tracing::warn!(
                    conn_id = %conn_id,
                    topic = %topic,
                    trans_id = %trans_id,
                    code = err.code(),
                    error = %err,
                    "publish rejected"
                );
                Some(error_frame(&err, Some(topic.to_string())))
            }
        }
    }

    /// Plain topics are relayed to their subscribers as-is.
    fn relay(&self, conn_id: &str, topic: &str, data: Value) {
        let Some(publication) = self.topics.publish(topic, data) else {
            return;
        };
        let delta = publication.envelope.is_delta();
        let message = ServerMessage::Publish {
            topic: topic.to_string(),
            data: publication.envelope,
        };
        let sent = self.connections.send_to_many(&publication.subscribers, &message);
        tracing::trace!(conn_id = %conn_id, topic = %topic, recipients = sent, delta, "relayed publish");
    }

    /// Forget a closed connection.
    pub fn disconnect(&self, conn_id: &str) {
        self.topics.unsubscribe_all(conn_id);
        self.connections.unregister(conn_id);
    }

    // ------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------

    pub fn set_full_sync(&self, mut request: FlagRequest) -> Result<FullSyncFlag> {
        request.branch_id = require_branch(&request.branch_id)?.to_string();
        Ok(self.raise_flag(request))
    }

    pub fn clear_full_sync(
        &self,
        branch_id: &str,
        module_id: Option<&str>,
        cleared_by: Option<String>,
    ) -> Result<FullSyncFlag> {
        let branch_id = require_branch(branch_id)?;
        let flag = self
            .flags
            .clear(branch_id, module_id, cleared_by)
            .ok_or_else(|| AppError::NotFound(format!("no full-sync flag for {branch_id}")))?;
        self.send_directive(&flag);
        Ok(flag)
    }

    pub fn list_full_sync(
        &self,
        branch_id: Option<&str>,
        module_id: Option<&str>,
        include_disabled: bool,
    ) -> Vec<FullSyncFlag> {
        self.flags.list(branch_id, module_id, include_disabled)
    }

    /// Clear transaction tables, keeping the removed rows in purge history.
    pub async fn purge(&self, request: PurgeRequest) -> Result<PurgeReport> {
        let branch_id = require_branch(&request.branch_id)?.to_string();
        let module_id = module_or_default(request.module_id.as_deref());
        let tables = resolve_tables(request.tables.as_deref());

        let shared = self.registry.get(&branch_id, &module_id)?;
        let mut dataset = shared.lock().await;

        let mut records = TableRows::new();
        {
            let store = dataset.read().await?;
            for table in tables.iter().filter(|t| store.has_table(t)) {
                records.insert(table.clone(), store.rows(table)?.to_vec());
            }
        }
        let report = dataset.clear_tables(&tables).await?;

        let entry = PurgeEntry {
            id: format!("purge-{}", uuid::Uuid::new_v4()),
            branch_id: branch_id.clone(),
            module_id: module_id.clone(),
            purged_at: to_rfc3339(self.clock.now_millis()),
            reason: request.reason.clone(),
            requested_by: request.requested_by.clone(),
            tables: report.cleared.keys().cloned().collect(),
            counts: report.cleared.clone(),
            records,
        };
        self.history.record(entry.clone());
        tracing::info!(
            branch_id = %branch_id,
            module_id = %module_id,
            purge_id = %entry.id,
            cleared = report.total_cleared(),
            "purged transaction tables"
        );

        let full_sync_flag = request.flag_full_sync.unwrap_or(true).then(|| {
            let mut meta = Map::new();
            meta.insert("purgeId".into(), Value::String(entry.id.clone()));
            self.raise_flag(FlagRequest {
                branch_id: branch_id.clone(),
                module_id: Some(module_id.clone()),
                reason: Some(request.reason.clone().unwrap_or_else(|| "purge".into())),
                requested_by: request.requested_by.clone(),
                meta,
            })
        });

        let cleared: Vec<TableName> = report.cleared.keys().cloned().collect();
        let announced = self.announce(
            &mut dataset,
            Change {
                action: "module:purge",
                table: None,
                row: None,
                mutation_id: None,
                notice_tables: &cleared,
            },
        )?;

        Ok(PurgeReport {
            total_cleared: report.total_cleared(),
            skipped_tables: report.skipped_tables,
            version: announced.version,
            purge: entry,
            full_sync_flag,
        })
    }

    pub fn purge_history(&self, branch_id: &str, module_id: &str) -> Vec<PurgeEntry> {
        self.history.list(branch_id, module_id)
    }

    /// Put the rows of a purge history entry back.
    pub async fn restore_purge(&self, request: RestoreRequest) -> Result<Value> {
        let branch_id = require_branch(&request.branch_id)?.to_string();
        let module_id = module_or_default(request.module_id.as_deref());
        let entry = self
            .history
            .find(&branch_id, &module_id, &request.purge_id)
            .ok_or_else(|| AppError::NotFound(format!("purge {}", request.purge_id)))?;

        let wanted = request.tables.as_deref().map(|t| resolve_tables(Some(t)));
        let data: TableRows = entry
            .records
            .into_iter()
            .filter(|(table, _)| wanted.as_ref().map_or(true, |w| w.contains(table)))
            .collect();

        let shared = self.registry.get(&branch_id, &module_id)?;
        let mut dataset = shared.lock().await;
        let report = dataset.restore_tables(&data, request.mode).await?;

        let restored: Vec<TableName> = report.inserted.keys().cloned().collect();
        let announced = self.announce(
            &mut dataset,
            Change {
                action: "module:restore",
                table: None,
                row: None,
                mutation_id: None,
                notice_tables: &restored,
            },
        )?;
        tracing::info!(
            branch_id = %branch_id,
            module_id = %module_id,
            purge_id = %request.purge_id,
            inserted = report.total_inserted(),
            "restored purged rows"
        );
        Ok(json!({
            "purgeId": request.purge_id,
            "mode": request.mode,
            "totalInserted": report.total_inserted(),
            "inserted": report.inserted,
            "duplicates": report.duplicates,
            "skippedTables": report.skipped_tables,
            "version": announced.version,
        }))
    }

    /// Close the business day: empty the dataset, reload its seed and by
    /// default tell every client to full-sync.
    pub async fn reset(&self, request: ResetRequest) -> Result<Value> {
        let branch_id = require_branch(&request.branch_id)?.to_string();
        let module_id = module_or_default(request.module_id.as_deref());
        let closed_date = business_day(self.clock.now_millis());

        let shared = self.registry.get(&branch_id, &module_id)?;
        let mut dataset = shared.lock().await;
        dataset.reset(Some(closed_date.clone())).await?;

        let full_sync_flag = request.flag_full_sync.unwrap_or(true).then(|| {
            let mut meta = Map::new();
            meta.insert("closedDate".into(), Value::String(closed_date.clone()));
            self.raise_flag(FlagRequest {
                branch_id: branch_id.clone(),
                module_id: Some(module_id.clone()),
                reason: Some(request.reason.clone().unwrap_or_else(|| "reset".into())),
                requested_by: request.requested_by.clone(),
                meta,
            })
        });

        // subscribers get the post-reset state whole rather than a diff
        self.topics.forget(&dataset_topics(&branch_id, &module_id));
        let tables = dataset.store().table_names().to_vec();
        let announced = self.announce(
            &mut dataset,
            Change {
                action: "module:reset",
                table: None,
                row: None,
                mutation_id: None,
                notice_tables: &tables,
            },
        )?;
        tracing::info!(
            branch_id = %branch_id,
            module_id = %module_id,
            closed_date = %closed_date,
            version = announced.version,
            "module reset"
        );
        Ok(json!({
            "branchId": branch_id,
            "moduleId": module_id,
            "version": announced.version,
            "closedDate": closed_date,
            "fullSyncFlag": full_sync_flag,
        }))
    }
}

/// Error frame for a failed publish.
pub fn error_frame(err: &AppError, topic: Option<String>) -> ServerMessage {
    ServerMessage::Error {
        code: err.code().to_string(),
        message: err.public_message(),
        topic,
        details: err.details(),
        requires_full_sync: err.requires_full_sync(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDurableStore, TableScope};
    use crate::schema::{default_schema, default_sequence_rules};
    use crate::websocket::Frame;
    use pos_sync_engine::ManualClock;
    use tokio::sync::mpsc;

    const START: u64 = 1_706_745_600_000;

    struct Harness {
        service: SyncService<MemoryDurableStore>,
        durable: Arc<MemoryDurableStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let (clock, shared) = ManualClock::shared(START);
        let durable = Arc::new(MemoryDurableStore::new());
        let config = Config {
            server_id: "srv-test".into(),
            ..Config::default()
        };
        let service = SyncService::new(
            Arc::new(config),
            Arc::new(default_schema()),
            default_sequence_rules(),
            durable.clone(),
            ConnectionManager::new_shared(),
            shared,
        );
        Harness {
            service,
            durable,
            clock,
        }
    }

    fn connect(service: &SyncService<MemoryDurableStore>) -> (String, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (service.connections().register(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame.text).unwrap());
        }
        frames
    }

    fn frames_of(frames: &[Value], kind: &str) -> Vec<Value> {
        frames.iter().filter(|f| f["type"] == kind).cloned().collect()
    }

    fn mutation(action: &str, table: &str, record: Value) -> Submission {
        Submission::Mutation(
            Mutation::from_data(&json!({"action": action, "table": table, "record": record})).unwrap(),
        )
    }

    fn ack_value(message: Option<ServerMessage>) -> Value {
        serde_json::to_value(message.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn insert_allocates_invoice_and_broadcasts() {
        let h = harness();
        let (conn, mut rx) = connect(&h.service);
        h.service.hello(&conn, "b1", Some("cashier".into())).await.unwrap();
        drain(&mut rx);

        let accepted = h
            .service
            .submit("b1", "pos", mutation("module:insert", "order_header", json!({"id": "o1"})), None, None)
            .await
            .unwrap();
        assert_eq!(accepted.result["record"]["invoiceNo"], json!("INV-000001"));
        assert_eq!(accepted.result["record"]["version"], json!(1));
        assert_eq!(accepted.result["sequence"], json!(1));
        assert_eq!(accepted.result["recordRef"]["key"], json!("o1"));

        let frames = drain(&mut rx);
        let events = frames_of(&frames, "event");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["action"], json!("module:insert"));
        assert_eq!(events[0]["notice"]["table"], json!("order_header"));

        let scope = TableScope::new("order_header", "b1", "pos");
        assert!(h.durable.get(scope, "o1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replayed_transaction_returns_identical_result() {
        let h = harness();
        let (conn, mut rx) = connect(&h.service);
        let data = json!({
            "action": "module:insert",
            "table": "order_header",
            "record": {"id": "o1", "status": "open"},
            "mutationId": "m1",
        });

        let first = ack_value(h.service.publish(&conn, "sync::b1::pos", data.clone(), Some(json!("t-1"))).await);
        let version = h.service.snapshot("b1", "pos").await.unwrap()["version"].clone();
        let second = ack_value(h.service.publish(&conn, "sync::b1::pos", data, Some(json!("t-1"))).await);

        assert_eq!(first["type"], json!("ack"));
        assert_eq!(first["duplicateTrans"], json!(false));
        assert_eq!(second["duplicateTrans"], json!(true));
        assert_eq!(
            serde_json::to_string(&first["result"]).unwrap(),
            serde_json::to_string(&second["result"]).unwrap()
        );
        assert_eq!(h.service.snapshot("b1", "pos").await.unwrap()["version"], version);
        drain(&mut rx);
    }

    #[tokio::test]
    async fn sync_publish_without_trans_id_is_rejected() {
        let h = harness();
        let (conn, _rx) = connect(&h.service);
        let reply = ack_value(
            h.service
                .publish(&conn, "sync::b1::pos", json!({"action": "module:insert"}), None)
                .await,
        );
        assert_eq!(reply["type"], json!("error"));
        assert_eq!(reply["code"], json!("missing-trans-id"));
    }

    #[tokio::test]
    async fn stale_version_and_guards_surface_as_error_frames() {
        let h = harness();
        let (conn, _rx) = connect(&h.service);
        let topic = "sync::b1::pos";
        let insert = json!({"action": "module:insert", "table": "order_header", "record": {"id": "o1"}});
        h.service.publish(&conn, topic, insert, Some(json!("t1"))).await;

        let save = json!({"action": "module:save", "table": "order_header", "record": {"id": "o1", "status": "paid", "version": 2}});
        let ok = ack_value(h.service.publish(&conn, topic, save.clone(), Some(json!("t2"))).await);
        assert_eq!(ok["result"]["record"]["version"], json!(2));

        let stale = ack_value(h.service.publish(&conn, topic, save, Some(json!("t3"))).await);
        assert_eq!(stale["type"], json!("error"));
        assert_eq!(stale["code"], json!("version-conflict"));
        assert_eq!(stale["details"]["reason"], json!("stale-version"));

        let guarded = json!({
            "action": "module:save",
            "table": "order_header",
            "record": {"id": "o9"},
            "concurrencyGuards": {"requireExisting": true}
        });
        let conflict = ack_value(h.service.publish(&conn, topic, guarded, Some(json!("t4"))).await);
        assert_eq!(conflict["type"], json!("error"));
        assert_eq!(conflict["requiresFullSync"], json!(true));
    }

    #[tokio::test]
    async fn subscribers_get_bootstrap_then_deltas() {
        let h = harness();
        let (conn, mut rx) = connect(&h.service);
        let boot = h.service.subscribe(&conn, "sync::b1::pos").await.unwrap().unwrap();
        let boot = serde_json::to_value(boot).unwrap();
        assert_eq!(boot["data"]["mode"], json!("snapshot"));
        assert_eq!(boot["data"]["snapshot"]["version"], json!(1));

        h.service
            .submit("b1", "pos", mutation("module:insert", "order_header", json!({"id": "o1"})), None, None)
            .await
            .unwrap();
        let publishes = frames_of(&drain(&mut rx), "publish");
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0]["data"]["mode"], json!("delta"));
        assert_eq!(publishes[0]["data"]["set"]["version"], json!(2));
    }

    #[tokio::test]
    async fn plain_topics_are_relayed() {
        let h = harness();
        let (listener, mut rx) = connect(&h.service);
        let (sender, _) = connect(&h.service);
        assert!(h.service.subscribe(&listener, "kds:bell").await.unwrap().is_none());

        let reply = h.service.publish(&sender, "kds:bell", json!({"ring": 1}), None).await;
        assert!(reply.is_none());
        let publishes = frames_of(&drain(&mut rx), "publish");
        assert_eq!(publishes[0]["data"]["snapshot"], json!({"ring": 1}));

        h.service.publish(&sender, "kds:bell", json!({"ring": 2}), None).await;
        let publishes = frames_of(&drain(&mut rx), "publish");
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0]["data"]["mode"], json!("delta"));
        assert_eq!(publishes[0]["data"]["set"], json!({"ring": 2}));
    }

    #[tokio::test]
    async fn purge_flags_full_sync_and_restores() {
        let h = harness();
        for id in ["o1", "o2"] {
            h.service
                .submit("b1", "pos", mutation("module:insert", "order_header", json!({"id": id})), None, None)
                .await
                .unwrap();
        }

        let report = h
            .service
            .purge(PurgeRequest {
                branch_id: "b1".into(),
                module_id: None,
                tables: Some(vec!["orders".into()]),
                reason: None,
                requested_by: Some("manager".into()),
                flag_full_sync: None,
            })
            .await
            .unwrap();
        assert_eq!(report.total_cleared, 2);
        assert_eq!(report.purge.counts["order_header"], 2);
        assert!(report.full_sync_flag.is_some());

        let delta = h.service.delta("b1", "pos", &DeltaRequest::default()).await.unwrap();
        assert!(delta.full_sync_required);
        assert!(delta.delta.requires_full_sync);

        let restored = h
            .service
            .restore_purge(RestoreRequest {
                branch_id: "b1".into(),
                module_id: None,
                purge_id: report.purge.id.clone(),
                mode: RestoreMode::Append,
                tables: None,
            })
            .await
            .unwrap();
        assert_eq!(restored["totalInserted"], json!(2));
        let scope = TableScope::new("order_header", "b1", "pos");
        assert_eq!(h.durable.list(scope).await.unwrap().len(), 2);

        h.service.clear_full_sync("b1", Some("pos"), None).unwrap();
        let delta = h.service.delta("b1", "pos", &DeltaRequest::default()).await.unwrap();
        assert!(!delta.full_sync_required);
    }

    #[tokio::test]
    async fn reset_closes_the_business_day() {
        let h = harness();
        h.service
            .submit("b1", "pos", mutation("module:insert", "order_header", json!({"id": "o1"})), None, None)
            .await
            .unwrap();
        h.clock.advance(60_000);

        let reset = h
            .service
            .reset(ResetRequest {
                branch_id: "b1".into(),
                module_id: Some("pos".into()),
                reason: None,
                requested_by: None,
                flag_full_sync: Some(false),
            })
            .await
            .unwrap();
        assert_eq!(reset["closedDate"], json!("2024-02-01"));
        assert_eq!(reset["version"], json!(3));
        assert!(reset["fullSyncFlag"].is_null());

        let snapshot = h.service.snapshot("b1", "pos").await.unwrap();
        assert_eq!(snapshot["snapshot"]["tables"]["order_header"], json!([]));
    }

    #[tokio::test]
    async fn hello_binds_and_snapshots_every_module() {
        let h = harness();
        let (conn, _rx) = connect(&h.service);
        let message = h.service.hello(&conn, "b1", None).await.unwrap();
        let value = serde_json::to_value(message).unwrap();
        assert_eq!(value["type"], json!("snapshot"));
        assert_eq!(value["modules"]["pos"]["meta"]["serverId"], json!("srv-test"));
        assert_eq!(h.service.connections().branch_of(&conn).as_deref(), Some("b1"));

        assert!(h.service.hello(&conn, "  ", None).await.is_err());
    }
}
