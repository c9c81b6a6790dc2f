//! HTTP surface of the control plane

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use brivas_core::BrivasError;
use brivas_lb::{BalancerSnapshot, ControlPlaneConfig, ControlPlaneReconciler, LbError};
use brivas_telemetry::MetricsRegistry;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::settings::load_config;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<ControlPlaneReconciler>,
    pub config_path: PathBuf,
    /// Set by the after-init callback
    pub ready: Arc<AtomicBool>,
    pub metrics: MetricsRegistry,
}

pub struct ApiError(BrivasError);

impl From<BrivasError> for ApiError {
    fn from(err: BrivasError) -> Self {
        Self(err)
    }
}

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

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "waiting for balancers" })),
        )
    }
}

async fn get_config(State(state): State<AppState>) -> Json<ControlPlaneConfig> {
    Json(state.reconciler.config())
}

async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    let last_state = state.reconciler.last_state();
    let snapshots = state.reconciler.snapshots();
    let balancers: Vec<&BalancerSnapshot> = snapshots.iter().map(|s| s.as_ref()).collect();
    Json(json!({
        "initialized": state.reconciler.is_initialized(),
        "state": last_state.as_deref(),
        "balancers": balancers,
        "metrics": state.metrics.snapshot()
    }))
}

/// Re-read the configuration file and apply it
async fn reload(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let config = load_config(&state.config_path).await?;
    let balancers = config.balancers.len();
    state.reconciler.reload(config).await?;
    info!(path = %state.config_path.display(), balancers, "Configuration reloaded over HTTP");
    Ok(Json(json!({ "balancers": balancers })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/state", get(get_state))
        .route("/api/v1/reload", post(reload))
        .with_state(state)
}
