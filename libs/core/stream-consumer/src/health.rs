//! Health endpoints for hosts running a consumer worker.
//!
//! - Liveness (`/health`, `/healthz`): the process answers
//! - Readiness (`/ready`, `/readyz`): worker `Running` with a live connection
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::lifecycle::WorkerStatus;
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub worker: Arc<dyn WorkerStatus>,
    pub app_name: String,
    pub app_version: String,
    pub stream_name: String,
}

impl HealthState {
    pub fn new(
        worker: Arc<dyn WorkerStatus>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            app_name: app_name.into(),
            app_version: app_version.into(),
            stream_name: stream_name.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Always OK while the server is up
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let lifecycle = state.worker.state();
    let healthy = state.worker.is_healthy();
    let fault = state.worker.fault();

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ready" } else { "not_ready" },
            "stream": state.stream_name,
            "checks": {
                "worker": lifecycle,
                "redis": if healthy { "ok" } else { "unavailable" },
            },
            "fault": fault,
        })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleState, WorkerFault};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct FixedStatus {
        state: LifecycleState,
        healthy: bool,
        fault: Option<WorkerFault>,
    }

    impl WorkerStatus for FixedStatus {
        fn state(&self) -> LifecycleState {
            self.state
        }

        fn is_healthy(&self) -> bool {
            self.healthy
        }

        fn fault(&self) -> Option<WorkerFault> {
            self.fault.clone()
        }
    }

    fn router(state: LifecycleState, healthy: bool, fault: Option<WorkerFault>) -> Router {
        let worker = Arc::new(FixedStatus {
            state,
            healthy,
            fault,
        });
        health_router(HealthState::new(worker, "consumer-worker", "0.1.0", "orders"))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_liveness_ignores_worker_state() {
        for uri in ["/health", "/healthz"] {
            let (status, body) = get_json(router(LifecycleState::Stopped, false, None), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["name"], "consumer-worker");
        }
    }

    #[tokio::test]
    async fn test_ready_when_running_and_connected() {
        let (status, body) = get_json(router(LifecycleState::Running, true, None), "/readyz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"]["worker"], "running");
        assert_eq!(body["stream"], "orders");
    }

    #[tokio::test]
    async fn test_not_ready_after_fault() {
        let fault = WorkerFault::new("Connection error: connection refused");
        let (status, body) =
            get_json(router(LifecycleState::Stopped, false, Some(fault)), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["checks"]["worker"], "stopped");
        assert_eq!(body["fault"]["reason"], "Connection error: connection refused");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_prometheus_text() {
        metrics::init_metrics().unwrap();

        let response = router(LifecycleState::Running, true, None)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
