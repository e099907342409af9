//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Returns gateway health as JSON.
///
/// Always 200; `state` tells orchestrators whether the gateway is draining.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "state": state.shutdown.health_state(),
        "in_flight": state.shutdown.in_flight_count(),
        "pending_results": state.correlation.results().len(),
        "open_streams": state.correlation.streams().len(),
        "worker_connections": state.workers.count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness check, always 200.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check: 200 when ready, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
