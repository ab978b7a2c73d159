// Module: http
// WebSocket signaling endpoint plus health and stats

pub mod error;
pub mod health;
pub mod stats;
pub mod websocket;

use axum::{routing::get, Router};
use confab_core::config::SignalingConfig;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::signaling::SignalingRouter;

pub use error::{AppError, AppResult};

/// Per-connection WebSocket limits
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    pub max_message_bytes: usize,
    pub outbound_queue_size: usize,
    pub keepalive: Duration,
}

impl From<&SignalingConfig> for WebSocketSettings {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            outbound_queue_size: config.outbound_queue_size,
            keepalive: Duration::from_secs(config.keepalive_seconds),
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self::from(&SignalingConfig::default())
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub signaling: Arc<SignalingRouter>,
    pub websocket: WebSocketSettings,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .merge(stats::create_stats_router())
        .route("/ws", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::signaling::StaticPublishPolicy;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use confab_sfu::{LocalBackend, MediaEngine, SfuConfig};
    use tower::ServiceExt;

    fn state() -> (AppState, Arc<LocalBackend>) {
        let backend = Arc::new(LocalBackend::new(Default::default()));
        let engine = MediaEngine::new(backend.clone(), SfuConfig::default());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&engine), 0));
        let signaling = Arc::new(SignalingRouter::new(
            registry,
            engine,
            Arc::new(StaticPublishPolicy::open()),
        ));
        (
            AppState {
                signaling,
                websocket: WebSocketSettings::default(),
            },
            backend,
        )
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state();
        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_fails_after_worker_death() {
        let (state, backend) = state();
        let failure = state.signaling.engine().worker_failure();
        backend.kill("test");
        tokio::time::timeout(Duration::from_secs(1), failure.cancelled())
            .await
            .unwrap();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/health/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (state, _) = state();
        let response = create_router(state)
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
