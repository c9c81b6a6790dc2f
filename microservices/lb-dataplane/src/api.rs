//! HTTP surface of the data plane

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use brivas_core::{BrivasError, DataPlaneState, DependencyStatus, ReadinessStatus};
use brivas_lb::{DataPlaneManager, LbError};
use brivas_telemetry::MetricsRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DataPlaneManager>,
    pub metrics: MetricsRegistry,
}

/// Error body with the service-level status code
pub struct ApiError(BrivasError);

impl From<LbError> for ApiError {
    fn from(err: LbError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = Json(json!({
            "error": self.0.to_string(),
            "code": self.0.error_code()
        }));
        (status, body).into_response()
    }
}

/// Ready while the last apply succeeded and shutdown has not started
pub async fn readiness(manager: &DataPlaneManager) -> ReadinessStatus {
    let start = Instant::now();
    let bgp = manager.modules().bgp.is_session_established().await;
    let bgp_latency = start.elapsed().as_millis() as u64;
    let shut_down = manager.is_shut_down().await;

    ReadinessStatus {
        ready: manager.is_healthy() && !shut_down,
        dependencies: vec![
            DependencyStatus {
                name: "kernel-state".to_string(),
                available: manager.is_healthy(),
                latency_ms: None,
            },
            DependencyStatus {
                name: "bgp-session".to_string(),
                available: bgp.unwrap_or(false),
                latency_ms: Some(bgp_latency),
            },
        ],
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = readiness(&state.manager).await;
    let code = if status.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn get_state(State(state): State<AppState>) -> Result<Json<DataPlaneState>, ApiError> {
    Ok(Json(state.manager.get_state().await?))
}

async fn put_state(
    State(state): State<AppState>,
    Json(desired): Json<DataPlaneState>,
) -> Result<StatusCode, ApiError> {
    state.manager.set_state(&desired).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "services": state.manager.stats(),
        "metrics": state.metrics.snapshot()
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/api/v1/state", get(get_state).put(put_state))
        .route("/api/v1/stats", get(get_stats))
        .with_state(state)
}
