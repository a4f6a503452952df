//! meteo-api — operator HTTP surface for meteogrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Service banner and version |
//! | GET | `/health` | Liveness probe |
//! | GET | `/database/stats` | Connection statistics for every database |
//! | GET | `/database/{name}/ping` | Borrow a connection and ping the server |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use meteo_pool::{ConnectionBackend, PoolRegistry};

/// Shared state for API handlers.
pub struct ApiState<B: ConnectionBackend> {
    pub registry: Arc<PoolRegistry<B>>,
}

impl<B: ConnectionBackend> Clone for ApiState<B> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

/// Build the operator router over `registry`.
pub fn build_router<B: ConnectionBackend>(registry: Arc<PoolRegistry<B>>) -> Router {
    let state = ApiState { registry };

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/database/stats", get(handlers::database_stats::<B>))
        .route("/database/{name}/ping", get(handlers::ping_database::<B>))
        .with_state(state)
}
