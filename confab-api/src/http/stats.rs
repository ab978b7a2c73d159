use axum::{extract::State, routing::get, Json, Router};
use confab_sfu::EngineStats;
use serde::Serialize;

use super::AppState;
use crate::registry::RegistryStats;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub registry: RegistryStats,
    pub media: EngineStats,
}

pub fn create_stats_router() -> Router<AppState> {
    Router::new().route("/api/stats", get(get_stats))
}

/// Connection, room and media object counts
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.signaling.registry().get_stats().await;
    let media = state.signaling.engine().get_stats().await;
    Json(StatsResponse { registry, media })
}
