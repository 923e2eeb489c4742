//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by `type`; fields use camelCase.

use std::sync::Arc;

use pos_sync_engine::{Envelope, RecordRef, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sync::FullSyncFlag;

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind the connection to a branch and request its snapshot.
    Hello {
        #[serde(default)]
        branch_id: Option<String>,
        #[serde(default)]
        role: Option<String>,
    },

    /// Submit a mutation or snapshot, or relay data on a plain topic.
    Publish {
        topic: String,
        #[serde(default)]
        data: Value,
        /// Transaction id; may also be carried inside `data`
        #[serde(default)]
        trans_id: Option<Value>,
    },

    /// Join a topic and receive its retained payload.
    Subscribe { topic: String },

    Unsubscribe { topic: String },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full state of every module of a branch, sent after `hello`.
    Snapshot {
        branch_id: String,
        modules: Map<String, Value>,
        full_sync_flags: Vec<FullSyncFlag>,
        meta: Value,
    },

    /// Answer to the connection that published a mutation.
    Ack {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        trans_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mutation_id: Option<String>,
        duplicate_trans: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_mutation_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        acked_mutation_id: Option<String>,
        result: Value,
    },

    /// An accepted mutation, broadcast to every connection of the branch.
    Event(SyncEvent),

    /// Topic payload, as a full snapshot or a delta against the last one.
    Publish { topic: String, data: Envelope },

    /// Row-level notice for table topic subscribers.
    #[serde(rename = "table:update")]
    TableUpdate(TableNotice),

    /// Administrative instruction.
    Directive(Directive),

    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        requires_full_sync: bool,
    },

    /// Response to ping.
    Pong,
}

/// An accepted change to a module dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub action: String,
    pub branch_id: String,
    pub module_id: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_ref: Option<RecordRef>,
    pub event_id: String,
    /// Per-dataset monotonic counter
    pub sequence: u64,
    #[serde(default)]
    pub meta: Value,
    /// Changed row, when the event concerns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<TableNotice>,
}

/// What happened to a table, for table topic subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableNotice {
    pub action: String,
    pub branch_id: String,
    pub module_id: String,
    pub table: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_ref: Option<RecordRef>,
    pub event_id: String,
}

/// A full-sync directive: the flag fields plus the directive name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Directive {
    pub directive: String,
    #[serde(flatten)]
    pub flag: FullSyncFlag,
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(code: impl Into<String>, message: impl Into<String>, topic: Option<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            topic,
            details: None,
            requires_full_sync: false,
        }
    }
}

/// A message serialized once and shared by every recipient of one
/// broadcast cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub cycle: u64,
    pub text: Arc<str>,
}

impl Frame {
    pub fn encode(cycle: u64, message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string(message)?;
        Ok(Self {
            cycle,
            text: Arc::from(text),
        })
    }
}
