//! Nestlog Server - reference remote for offline-first activity sync.
//!
//! Serves the activities API that `nestlog-sync` clients replicate against:
//! idempotent creates keyed by client id, optimistic-concurrency updates
//! that answer `409` with the stored row, paginated listings per owner, and
//! deletes. Storage is in memory.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod store;

use crate::config::Config;
use crate::store::ActivityStore;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub store: Arc<ActivityStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(ActivityStore::new()),
            config: Arc::new(config),
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
