//! REST API Routes Module
//!
//! Route handlers by resource, plus the top-level router assembly with
//! CORS. Authentication is a gateway concern; handlers read the caller
//! from the injected identity header via the `AuthContext` extractor.

pub mod health;
pub mod personas;
pub mod profiles;
pub mod sessions;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::openapi::ApiDoc;
use crate::state::AppState;
use crate::ws;

/// Handler for the /openapi.json endpoint.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// Build the CORS layer: permissive in development (no configured
/// origins), restricted to the configured list otherwise.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(crate::auth::USER_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        tracing::info!("CORS: development mode, allowing all origins");
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        tracing::info!(origins = ?origins, "CORS: restricted origins");
        cors.allow_origin(parsed)
    }
}

/// Create the complete API router.
pub fn create_api_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    Router::new()
        .nest("/sessions", sessions::create_router())
        .nest("/personas", personas::create_router())
        .nest("/api-profiles", profiles::create_router())
        .nest("/health", health::create_router())
        .route("/ws/sessions/:id", get(ws::session_stream))
        .route("/openapi.json", get(openapi_json))
        .layer(cors)
        .with_state(state)
}
