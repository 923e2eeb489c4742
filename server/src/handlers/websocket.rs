//! WebSocket handler for real-time sync.
//!
//! Handles WebSocket connections and dispatches client frames to the sync
//! service while the connection's outbound queue is drained by a send task.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::db::DurableStore;
use crate::sync::{error_frame, SyncService};
use crate::websocket::{ClientMessage, Frame, ServerMessage};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing frames
/// 3. Binds the connection when the upgrade named a branch
/// 4. Processes incoming messages in a loop
/// 5. Cleans up on disconnect
pub async fn handle_websocket_connection<D: DurableStore>(
    socket: WebSocket,
    sync: Arc<SyncService<D>>,
    branch_id: Option<String>,
    role: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let conn_manager = sync.connections().clone();
    let conn_id = conn_manager.register(tx);

    tracing::info!(
        conn_id = %conn_id,
        branch_id = ?branch_id,
        "WebSocket client connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame.text.to_string().into())).await {
                tracing::warn!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    if let Some(branch_id) = branch_id.filter(|b| !b.trim().is_empty()) {
        let reply = match sync.hello(&conn_id, &branch_id, role).await {
            Ok(snapshot) => snapshot,
            Err(e) => error_frame(&e, None),
        };
        conn_manager.send_to(&conn_id, &reply);
    }

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(reply) = process_message(&text, &sync, &conn_id).await {
                    conn_manager.send_to(&conn_id, &reply);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    sync.disconnect(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client frame and return the reply owed to the sender, if any.
pub async fn process_message<D: DurableStore>(
    text: &str,
    sync: &SyncService<D>,
    conn_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                "invalid-message",
                format!("Invalid message format: {}", e),
                None,
            ));
        }
    };

    match client_msg {
        ClientMessage::Hello { branch_id, role } => {
            let branch_id = branch_id
                .filter(|b| !b.trim().is_empty())
                .or_else(|| sync.connections().branch_of(conn_id));
            let Some(branch_id) = branch_id else {
                return Some(ServerMessage::error(
                    "missing-branch-id",
                    "hello requires a branchId",
                    None,
                ));
            };
            Some(match sync.hello(conn_id, &branch_id, role).await {
                Ok(snapshot) => snapshot,
                Err(e) => error_frame(&e, None),
            })
        }

        ClientMessage::Publish {
            topic,
            data,
            trans_id,
        } => sync.publish(conn_id, &topic, data, trans_id).await,

        ClientMessage::Subscribe { topic } => match sync.subscribe(conn_id, &topic).await {
            Ok(bootstrap) => bootstrap,
            Err(e) => Some(error_frame(&e, Some(topic))),
        },

        ClientMessage::Unsubscribe { topic } => {
            sync.unsubscribe(conn_id, &topic);
            None
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
