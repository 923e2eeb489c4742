//! Unit tests for the WebSocket protocol, from the client's side.

use pos_sync_engine::{delta_envelope, Envelope};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Frames a POS terminal sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClientMessage {
    Hello {
        branch_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    Publish {
        topic: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        trans_id: Option<String>,
    },
    Subscribe {
        topic: String,
    },
    Ping,
}

/// Frames a POS terminal reacts to. Anything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[allow(dead_code)]
enum ServerMessage {
    Ack {
        topic: String,
        #[serde(default)]
        trans_id: Option<String>,
        duplicate_trans: bool,
        result: Value,
    },
    Event {
        action: String,
        branch_id: String,
        version: u64,
        sequence: u64,
    },
    Publish {
        topic: String,
        data: Envelope,
    },
    #[serde(rename = "table:update")]
    TableUpdate {
        table: String,
        action: String,
    },
    Directive {
        directive: String,
        branch_id: String,
        enabled: bool,
    },
    Error {
        code: String,
        #[serde(default)]
        requires_full_sync: bool,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

/// What a subscriber holds for a topic after applying each frame.
#[derive(Default)]
struct Replica {
    payload: Option<Value>,
}

impl Replica {
    fn apply(&mut self, envelope: &Envelope) {
        self.payload = Some(envelope.apply(self.payload.as_ref()));
    }
}

#[cfg(test)]
mod websocket_protocol_tests {
    use super::*;

    #[test]
    fn test_client_frames_serialize() {
        let hello = serde_json::to_value(ClientMessage::Hello {
            branch_id: "b1".into(),
            role: Some("cashier".into()),
        })
        .unwrap();
        assert_eq!(hello, json!({"type": "hello", "branchId": "b1", "role": "cashier"}));

        let publish = serde_json::to_value(ClientMessage::Publish {
            topic: "sync::b1::pos".into(),
            data: json!({"action": "module:insert", "table": "order_header", "record": {"id": "o1"}}),
            trans_id: Some("t-1".into()),
        })
        .unwrap();
        assert_eq!(publish["transId"], json!("t-1"));
        assert_eq!(publish["data"]["record"]["id"], json!("o1"));

        let subscribe = serde_json::to_value(ClientMessage::Subscribe {
            topic: "sync-table::b1::order_header".into(),
        })
        .unwrap();
        assert_eq!(subscribe["type"], json!("subscribe"));

        assert_eq!(serde_json::to_value(ClientMessage::Ping).unwrap(), json!({"type": "ping"}));
    }

    #[test]
    fn test_ack_and_event_frames_parse() {
        let ack: ServerMessage = serde_json::from_value(json!({
            "type": "ack",
            "topic": "sync::b1::pos",
            "transId": "t-1",
            "duplicateTrans": false,
            "result": {"action": "module:insert", "version": 2}
        }))
        .unwrap();
        match ack {
            ServerMessage::Ack { topic, trans_id, duplicate_trans, result } => {
                assert_eq!(topic, "sync::b1::pos");
                assert_eq!(trans_id.as_deref(), Some("t-1"));
                assert!(!duplicate_trans);
                assert_eq!(result["version"], json!(2));
            }
            other => panic!("expected ack, got {:?}", other),
        }

        let event: ServerMessage = serde_json::from_value(json!({
            "type": "event",
            "action": "module:insert",
            "branchId": "b1",
            "moduleId": "pos",
            "version": 2,
            "table": "order_header",
            "eventId": "evt-1",
            "sequence": 7,
            "meta": {}
        }))
        .unwrap();
        assert!(matches!(
            event,
            ServerMessage::Event { ref action, ref branch_id, version: 2, sequence: 7 }
                if action == "module:insert" && branch_id == "b1"
        ));
    }

    #[test]
    fn test_directive_and_error_frames_parse() {
        let directive: ServerMessage = serde_json::from_value(json!({
            "type": "directive",
            "directive": "full-sync-flag",
            "id": "flag-1",
            "branchId": "b1",
            "moduleId": "pos",
            "enabled": true,
            "updatedAt": "2024-02-01T00:00:00Z",
            "meta": {}
        }))
        .unwrap();
        assert!(matches!(
            directive,
            ServerMessage::Directive { ref directive, enabled: true, .. } if directive == "full-sync-flag"
        ));

        let error: ServerMessage = serde_json::from_value(json!({
            "type": "error",
            "code": "version-conflict",
            "message": "stale",
            "requiresFullSync": true
        }))
        .unwrap();
        assert!(matches!(
            error,
            ServerMessage::Error { ref code, requires_full_sync: true } if code == "version-conflict"
        ));

        let notice: ServerMessage = serde_json::from_value(json!({
            "type": "table:update",
            "action": "module:merge",
            "branchId": "b1",
            "moduleId": "pos",
            "table": "order_line",
            "version": 4,
            "eventId": "evt-4"
        }))
        .unwrap();
        assert!(matches!(notice, ServerMessage::TableUpdate { ref table, .. } if table == "order_line"));
    }

    #[test]
    fn test_unknown_frames_are_tolerated() {
        let frame: ServerMessage =
            serde_json::from_value(json!({"type": "snapshot", "branchId": "b1"})).unwrap();
        assert!(matches!(frame, ServerMessage::Unknown));
        let pong: ServerMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(pong, ServerMessage::Pong));
    }

    #[test]
    fn test_replica_follows_publish_envelopes() {
        let states = [
            json!({"version": 1, "snapshot": {"tables": {}}}),
            json!({"version": 2, "snapshot": {"tables": {"order_header": [{"id": "o1"}]}}}),
            json!({"version": 3, "snapshot": {"tables": {"order_header": [{"id": "o1"}]}}, "fullSyncRequired": true}),
            json!({"version": 4, "snapshot": {"tables": {"order_header": []}}}),
        ];

        let mut replica = Replica::default();
        let mut retained: Option<Value> = None;
        for (i, state) in states.iter().enumerate() {
            let envelope = delta_envelope(retained.as_ref(), state).unwrap();
            assert_eq!(envelope.is_delta(), i > 0);

            let frame = json!({"type": "publish", "topic": "sync::b1::pos", "data": envelope});
            let ServerMessage::Publish { topic, data } = serde_json::from_value(frame).unwrap() else {
                panic!("expected publish frame");
            };
            assert_eq!(topic, "sync::b1::pos");
            replica.apply(&data);
            assert_eq!(replica.payload.as_ref(), Some(state));
            retained = Some(state.clone());
        }
    }

    #[test]
    fn test_identical_state_sends_nothing() {
        let state = json!({"version": 5});
        assert!(delta_envelope(Some(&state), &state).is_none());
    }
}
