//! POS Sync Server - keeps branch POS terminals on one view of their data.
//!
//! This server provides HTTP and WebSocket endpoints for POS clients to read
//! snapshots, fetch insert-only deltas and submit mutations, which are fanned
//! out to every connection of the branch.

mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod schema;
mod store;
mod sync;
mod websocket;

use crate::config::Config;
use crate::db::{Durable, MemoryDurableStore, PgDurableStore};
use crate::sync::SyncService;
use crate::websocket::ConnectionManager;
use axum::Router;
use pos_sync_engine::{Schema, SequenceRules, SharedClock, SystemClock};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sync: Arc<SyncService>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        schema: Schema,
        rules: SequenceRules,
        durable: Durable,
        clock: SharedClock,
    ) -> Self {
        let conn_manager = ConnectionManager::new_shared();
        let sync = Arc::new(SyncService::new(
            config.clone(),
            Arc::new(schema),
            rules,
            Arc::new(durable),
            conn_manager.clone(),
            clock,
        ));
        Self {
            config,
            sync,
            conn_manager,
        }
    }
}

/// Build the router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pos_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting POS Sync Server on {}:{}", config.host, config.port);

    let schema = schema::load_schema(&config)?;
    schema.validate(&config.persisted_tables)?;
    let rules = schema::load_sequence_rules(&config)?;
    let seeds = schema::load_seeds(&config)?;

    let durable = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections).await?;
            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;
            Durable::Postgres(PgDurableStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, durable tables are kept in memory");
            Durable::Memory(MemoryDurableStore::new())
        }
    };
    tracing::info!(
        durable = durable.kind(),
        server_id = %config.server_id,
        persisted_tables = ?config.persisted_tables,
        "Durable storage ready"
    );

    let state = AppState::new(
        Arc::new(config.clone()),
        schema,
        rules,
        durable,
        SystemClock::shared(),
    );
    for (module_id, rows) in seeds {
        tracing::info!(module_id = %module_id, tables = rows.len(), "registering module seed");
        state.sync.registry().set_seed(&module_id, rows);
    }
    let app = app(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
