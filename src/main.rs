//! Switchboard - conversational flow engine
//!
//! A stateful, event-driven engine that drives caller-style dialogs
//! through declarative flow definitions: classified intents and tool
//! results move a per-session state machine, and every step is logged and
//! fanned out to live observers.

mod api;
mod classify;
mod config;
mod db;
mod engine;
mod event;
mod expr;
mod fanout;
mod flow;
mod paths;
mod store;
mod template;
mod tools;

use api::{create_router, create_ws_router, AppState};
use axum::http::HeaderValue;
use config::Config;
use db::Database;
use engine::Orchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use store::kv::KvBackend;
use store::SessionStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Session store backend
    let kv: Arc<dyn KvBackend> = match &config.store_url {
        Some(url) => {
            tracing::info!(%url, "connecting to session store");
            Arc::new(store::redis::RedisKv::connect(url).await?)
        }
        None => {
            tracing::info!("no store URL configured, using in-process store");
            Arc::new(store::memory::MemoryKv::new())
        }
    };
    let session_store = SessionStore::new(kv);

    // Flow definition database
    let flows = match &config.db_path {
        Some(path) => {
            tracing::info!(%path, "opening flow database");
            Database::open(path)?
        }
        None => Database::open_in_memory()?,
    };

    // Classifier and tool workers
    let classifier = config.classifier.build();
    let registry = Arc::new(tools::reservation::demo_registry());
    tracing::info!(tools = ?registry.names(), "tool registry initialized");

    let orchestrator = Orchestrator::new(session_store, classifier, registry);
    let state = AppState::new(orchestrator, flows);

    let cors = match &config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>()?)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let api_router = create_router(state.clone())
        .layer(cors.clone())
        .layer(TraceLayer::new_for_http());
    let ws_router = create_ws_router(state).layer(cors);

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    tracing::info!(%api_addr, %ws_addr, "switchboard listening");

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;

    let api = async { axum::serve(api_listener, api_router).await };
    let ws = async { axum::serve(ws_listener, ws_router).await };
    tokio::try_join!(api, ws)?;

    Ok(())
}
