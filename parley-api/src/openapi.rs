//! OpenAPI Documentation

use utoipa::OpenApi;

use crate::routes::{health, personas, profiles, sessions};

/// OpenAPI document for the Parley API, served at `/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Parley API",
        description = "Multi-persona group-chat orchestration service",
    ),
    paths(
        sessions::create_session,
        sessions::list_sessions,
        sessions::update_session,
        sessions::delete_session,
        sessions::delete_sessions,
        sessions::enqueue_message,
        sessions::list_messages,
        personas::create_persona,
        personas::list_personas,
        personas::get_persona,
        personas::update_persona,
        personas::delete_persona,
        personas::ingest_text,
        personas::ingest_url,
        personas::refresh_rag,
        profiles::create_profile,
        profiles::list_profiles,
        profiles::get_profile,
        profiles::update_profile,
        profiles::delete_profile,
        health::health,
    ),
    components(schemas(
        sessions::CreateSessionRequest,
        sessions::CreateSessionResponse,
        sessions::SessionResponse,
        sessions::UpdateSessionRequest,
        sessions::DeleteSessionsRequest,
        sessions::DeleteSessionsResponse,
        sessions::MessagePayload,
        sessions::EnqueueResponse,
        sessions::MessageResponse,
        personas::CreatePersonaRequest,
        personas::UpdatePersonaRequest,
        personas::PersonaResponse,
        personas::IngestTextRequest,
        personas::IngestUrlRequest,
        personas::IngestResponse,
        profiles::CreateProfileRequest,
        profiles::UpdateProfileRequest,
        profiles::ProfileResponse,
        health::HealthResponse,
    )),
    tags(
        (name = "Sessions", description = "Session lifecycle, messages, history"),
        (name = "Personas", description = "Persona CRUD and knowledge ingestion"),
        (name = "ApiProfiles", description = "Upstream LLM endpoint profiles"),
        (name = "Health", description = "Service health"),
    )
)]
pub struct ApiDoc;
