//! HTTP route definitions.

mod health;
mod manage;
mod sync;
mod ws;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(manage::routes())
        .merge(ws::routes())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use pos_sync_engine::ManualClock;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::db::{Durable, MemoryDurableStore};
    use crate::schema::{default_schema, default_sequence_rules};
    use crate::AppState;

    fn test_app() -> Router {
        let (_, clock) = ManualClock::shared(1_706_745_600_000);
        let config = Config {
            server_id: "srv-routes".into(),
            ..Config::default()
        };
        let state = AppState::new(
            Arc::new(config),
            default_schema(),
            default_sequence_rules(),
            Durable::Memory(MemoryDurableStore::new()),
            clock,
        );
        crate::app(state)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_server_id() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["serverId"], json!("srv-routes"));
        assert_eq!(body["datasets"], json!(0));
    }

    #[tokio::test]
    async fn save_is_deduplicated_and_shows_in_delta() {
        let app = test_app();
        let save = json!({
            "table": "order_header",
            "record": {"id": "o1", "total": 10},
            "transId": "t-1"
        });

        let (status, first) = call(&app, Method::POST, "/api/sync/b1/pos/save", Some(save.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["duplicateTrans"], json!(false));
        assert_eq!(first["result"]["record"]["invoiceNo"], json!("INV-000001"));

        let (_, again) = call(&app, Method::POST, "/api/sync/b1/pos/save", Some(save)).await;
        assert_eq!(again["duplicateTrans"], json!(true));
        assert_eq!(again["result"], first["result"]);

        let (status, delta) = call(&app, Method::POST, "/api/sync/b1/pos/delta", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(delta["deltas"]["order_header"].as_array().map(Vec::len), Some(1));
        assert_eq!(delta["fullSyncRequired"], json!(false));
        assert_eq!(delta["serverId"], json!("srv-routes"));
    }

    #[tokio::test]
    async fn keyless_save_gets_generated_id() {
        let app = test_app();
        let save = json!({"table": "order_header", "record": {"total": 4}});
        let (status, body) = call(&app, Method::POST, "/api/sync/b1/pos/save", Some(save)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["action"], json!("module:insert"));
        let id = body["result"]["record"]["id"].as_str().unwrap_or_default();
        assert!(id.starts_with("order_header-"), "unexpected id {id}");
    }

    #[tokio::test]
    async fn unknown_table_is_not_found() {
        let app = test_app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/b1/pos/save",
            Some(json!({"table": "ghost", "record": {"id": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("table-not-registered"));
    }

    #[tokio::test]
    async fn full_sync_flag_forces_delta_resync() {
        let app = test_app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/manage/full-sync",
            Some(json!({"branchId": "b1", "reason": "support"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flag"]["enabled"], json!(true));

        let (_, delta) = call(&app, Method::POST, "/api/sync/b1/pos/delta", Some(json!({}))).await;
        assert_eq!(delta["requiresFullSync"], json!(true));
        assert_eq!(delta["fullSyncFlags"][0]["reason"], json!("support"));

        let (status, _) = call(
            &app,
            Method::DELETE,
            "/api/manage/full-sync",
            Some(json!({"branchId": "b1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = call(&app, Method::GET, "/api/manage/full-sync?branchId=b1", None).await;
        assert_eq!(listed["flags"], json!([]));
    }

    #[tokio::test]
    async fn purge_lands_in_history() {
        let app = test_app();
        call(
            &app,
            Method::POST,
            "/api/sync/b1/pos/save",
            Some(json!({"table": "order_header", "record": {"id": "o1"}})),
        )
        .await;

        let (status, report) = call(
            &app,
            Method::POST,
            "/api/manage/purge",
            Some(json!({"branchId": "b1", "tables": ["orders"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["totalCleared"], json!(1));

        let (_, history) = call(&app, Method::GET, "/api/manage/purge-history/b1/pos", None).await;
        assert_eq!(history["entries"].as_array().map(Vec::len), Some(1));
        assert_eq!(history["entries"][0]["tables"], json!(["order_header"]));
    }
}
