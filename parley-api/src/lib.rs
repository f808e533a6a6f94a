//! PARLEY API - HTTP/WebSocket Surface
//!
//! Thin translation from HTTP and WebSocket to the orchestrator and
//! store layers. Authentication is performed by the fronting gateway;
//! this crate validates ownership (including the owner token embedded
//! in every session id) on each request.

pub mod auth;
pub mod config;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod ws;

// Re-export commonly used types
pub use auth::{require_session_owner, AuthContext, USER_HEADER};
pub use config::AppConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use openapi::ApiDoc;
pub use routes::create_api_router;
pub use state::AppState;
