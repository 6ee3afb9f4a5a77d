//! HTTP API and streaming observer endpoints.

mod handlers;
mod types;
mod ws;

pub use handlers::create_router;
pub use ws::create_ws_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::db::Database;
use crate::engine::Orchestrator;
use crate::fanout::Fanout;
use crate::store::SessionStore;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: SessionStore,
    pub fanout: Arc<Fanout>,
    pub flows: Database,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, flows: Database) -> Self {
        let store = orchestrator.store().clone();
        let fanout = Arc::new(Fanout::new(store.clone()));
        Self {
            orchestrator,
            store,
            fanout,
            flows,
            started_at: Instant::now(),
        }
    }
}
