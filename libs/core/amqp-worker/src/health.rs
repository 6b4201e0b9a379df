//! Health check handlers for AMQP workers.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::metrics;
use crate::worker::Worker;

/// Shared state for health endpoints.
#[derive(Clone, Debug)]
pub struct HealthState {
    pub worker: Worker,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(worker: Worker, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            worker,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy" if responding.
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready while the worker is listening on an open connection and has not
/// started shutting down.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let worker = &state.worker;
    let connected = worker.is_connected();
    let listening = worker.is_listening();

    let body = json!({
        "status": if connected && listening { "ready" } else { "not_ready" },
        "checks": {
            "broker": if connected { "ok" } else { "disconnected" },
            "worker": worker.shutdown_state().to_string(),
        }
    });

    if connected && listening {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create a router with the health, readiness and metrics endpoints.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
