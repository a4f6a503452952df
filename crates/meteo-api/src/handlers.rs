//! Operator API handlers.
//!
//! Pool failures map to HTTP statuses the way callers of the CRUD service
//! expect: saturation and shutdown are 503, an unknown database is 404,
//! anything else is 500.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::FutureExt;
use meteo_pool::{ConnectionBackend, PoolError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            status: "success",
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            status: "error",
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a pool failure.
pub fn status_for(err: &PoolError) -> StatusCode {
    match err {
        e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        PoolError::UnknownDatabase(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "meteogrid",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// GET /database/stats
pub async fn database_stats<B: ConnectionBackend>(State(state): State<ApiState<B>>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.connection_stats())
}

/// GET /database/{name}/ping
pub async fn ping_database<B: ConnectionBackend>(
    State(state): State<ApiState<B>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let started = Instant::now();
    let result = match state.registry.database(&name).await {
        Ok(db) => {
            db.with_connection(|conn| {
                async move {
                    if conn.ping().await {
                        Ok(())
                    } else {
                        Err(PoolError::Database("server did not answer ping".into()))
                    }
                }
                .boxed()
            })
            .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "database": name,
            "latency_ms": started.elapsed().as_millis() as u64,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(database = %name, error = %e, "database ping failed");
            error_response(&e.to_string(), status_for(&e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use meteo_pool::{BoxError, ConnectionFactory, Endpoint, PoolConfig, PoolRegistry};

    #[derive(Debug)]
    struct StubBackend {
        ping_ok: bool,
    }

    #[async_trait]
    impl ConnectionBackend for StubBackend {
        fn is_open(&self) -> bool {
            true
        }
        async fn ping(&mut self) -> bool {
            self.ping_ok
        }
        async fn commit(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        async fn rollback(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    struct StubFactory {
        reachable: AtomicBool,
        ping_ok: bool,
    }

    #[async_trait]
    impl ConnectionFactory<StubBackend> for StubFactory {
        async fn connect(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<StubBackend, BoxError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err("connection refused".into());
            }
            Ok(StubBackend { ping_ok: self.ping_ok })
        }
    }

    fn test_state(reachable: bool, ping_ok: bool, pooling: bool) -> ApiState<StubBackend> {
        let config = PoolConfig::new(Endpoint::new("localhost", 3306, "root", "", "meteo_local"))
            .with_bounds(0, 1)
            .with_acquire_timeout(Duration::from_millis(50));
        let configs = BTreeMap::from([("local".to_string(), config)]);
        let factory: Arc<dyn ConnectionFactory<StubBackend>> = Arc::new(StubFactory {
            reachable: AtomicBool::new(reachable),
            ping_ok,
        });
        ApiState {
            registry: Arc::new(PoolRegistry::new(configs, pooling, factory)),
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&PoolError::AcquireTimeout(Duration::from_secs(1))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&PoolError::PoolClosed), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&PoolError::UnknownDatabase("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&PoolError::Database("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn health_is_healthy() {
        let resp = health().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "healthy");
    }

    #[tokio::test]
    async fn root_reports_version() {
        let resp = root().await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["service"], "meteogrid");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn stats_wraps_connection_stats() {
        let state = test_state(true, true, true);
        state.registry.warm_up().await.unwrap();
        let resp = database_stats(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["pooling_enabled"], true);
        assert_eq!(body["data"]["pools"]["local"]["max_connections"], 1);
        state.registry.close_all().await;
    }

    #[tokio::test]
    async fn ping_succeeds() {
        let state = test_state(true, true, true);
        let resp = ping_database(State(state.clone()), Path("local".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["database"], "local");
        state.registry.close_all().await;
    }

    #[tokio::test]
    async fn ping_unpooled_succeeds() {
        let state = test_state(true, true, false);
        let resp = ping_database(State(state.clone()), Path("local".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        state.registry.close_all().await;
    }

    #[tokio::test]
    async fn ping_unknown_database_is_404() {
        let state = test_state(true, true, true);
        let resp = ping_database(State(state), Path("archive".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ping_unreachable_server_is_503() {
        let state = test_state(false, true, true);
        let resp = ping_database(State(state), Path("local".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn ping_after_shutdown_is_503() {
        let state = test_state(true, true, true);
        state.registry.close_all().await;
        let resp = ping_database(State(state), Path("local".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn failed_ping_is_500() {
        let state = test_state(true, false, true);
        let resp = ping_database(State(state.clone()), Path("local".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        state.registry.close_all().await;
    }
}
