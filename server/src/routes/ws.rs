//! WebSocket upgrade route.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Optional binding given at upgrade time.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub branch_id: Option<String>,
    pub role: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws - Upgrade to the sync WebSocket protocol.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let sync = state.sync.clone();
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, sync, query.branch_id, query.role)
    })
}
