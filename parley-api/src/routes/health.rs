//! Health Check Routes

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    /// Sessions with a live runtime binding in this process.
    pub live_sessions: usize,
}

/// GET /health - Liveness and basic runtime stats.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
        live_sessions: state.orchestrator.live_sessions(),
    })
}

/// Create the health routes router.
pub fn create_router() -> axum::Router<AppState> {
    axum::Router::new().route("/", axum::routing::get(health))
}
