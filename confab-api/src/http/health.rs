//! Health check endpoints
//!
//! Provides liveness and readiness checks for monitoring probes.

use axum::{extract::State, response::IntoResponse, routing::get, Router};

use super::{AppError, AppResult, AppState};

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Ready while the media worker is alive
pub async fn readiness_check(State(state): State<AppState>) -> AppResult<&'static str> {
    if state.signaling.engine().worker_failure().is_cancelled() {
        return Err(AppError::service_unavailable("Media worker is not running"));
    }
    Ok("READY")
}
