//! Persona REST API Routes
//!
//! Persona CRUD plus knowledge-base ingestion. Deleting a persona drops
//! its retrieval collection; re-ingesting a source replaces that
//! source's chunks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    auth::AuthContext,
    error::{ApiError, ApiResult},
    state::AppState,
};
use parley_core::{Persona, PersonaId};
use parley_store::{NewPersona, PersonaPatch};

/// Source tag for ad-hoc text ingestion.
const DEFAULT_TEXT_SOURCE: &str = "manual";

/// Source tag for the persona's own background document.
const BACKGROUND_SOURCE: &str = "background";

// ============================================================================
// DTOS
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePersonaRequest {
    pub display_name: String,
    pub handle: Option<String>,
    pub system_prompt: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_proactivity")]
    pub proactivity: f64,
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
    #[serde(default = "default_max_agents")]
    pub max_agents_per_turn: usize,
    pub api_profile_id: Option<i64>,
    pub embedding_profile_id: Option<i64>,
    #[serde(default)]
    pub is_default: bool,
    pub background_text: Option<String>,
    #[serde(default = "default_rag_top_k")]
    pub rag_top_k: usize,
}

fn default_tone() -> String {
    "neutral".to_string()
}
fn default_proactivity() -> f64 {
    0.5
}
fn default_memory_window() -> usize {
    8
}
fn default_max_agents() -> usize {
    2
}
fn default_rag_top_k() -> usize {
    parley_core::DEFAULT_RAG_TOP_K
}

impl CreatePersonaRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.display_name.trim().is_empty() {
            return Err(ApiError::validation("display_name must not be empty"));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(ApiError::validation("system_prompt must not be empty"));
        }
        validate_ranges(
            Some(self.proactivity),
            Some(self.memory_window),
            Some(self.max_agents_per_turn),
            Some(self.rag_top_k),
        )
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdatePersonaRequest {
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub system_prompt: Option<String>,
    pub tone: Option<String>,
    pub proactivity: Option<f64>,
    pub memory_window: Option<usize>,
    pub max_agents_per_turn: Option<usize>,
    pub api_profile_id: Option<i64>,
    pub embedding_profile_id: Option<i64>,
    pub is_default: Option<bool>,
    pub background_text: Option<String>,
    pub rag_top_k: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PersonaResponse {
    pub id: i64,
    pub owner: String,
    pub handle: String,
    pub display_name: String,
    pub system_prompt: String,
    pub tone: String,
    pub proactivity: f64,
    pub memory_window: usize,
    pub max_agents_per_turn: usize,
    pub api_profile_id: Option<i64>,
    pub embedding_profile_id: Option<i64>,
    pub is_default: bool,
    pub background_text: Option<String>,
    pub rag_top_k: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Persona> for PersonaResponse {
    fn from(persona: Persona) -> Self {
        Self {
            id: persona.id,
            owner: persona.owner,
            handle: persona.handle,
            display_name: persona.display_name,
            system_prompt: persona.system_prompt,
            tone: persona.tone,
            proactivity: persona.proactivity,
            memory_window: persona.memory_window,
            max_agents_per_turn: persona.max_agents_per_turn,
            api_profile_id: persona.api_profile_id,
            embedding_profile_id: persona.embedding_profile_id,
            is_default: persona.is_default,
            background_text: persona.background_text,
            rag_top_k: persona.rag_top_k,
            created_at: persona.created_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestTextRequest {
    pub text: String,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestUrlRequest {
    pub url: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub chunks_added: usize,
    pub collection: String,
}

fn validate_ranges(
    proactivity: Option<f64>,
    memory_window: Option<usize>,
    max_agents: Option<usize>,
    rag_top_k: Option<usize>,
) -> Result<(), ApiError> {
    if let Some(p) = proactivity {
        if !(0.0..=1.0).contains(&p) {
            return Err(ApiError::validation("proactivity must be within [0, 1]"));
        }
    }
    if let Some(w) = memory_window {
        if !(1..=200).contains(&w) {
            return Err(ApiError::validation("memory_window must be within [1, 200]"));
        }
    }
    if let Some(m) = max_agents {
        if !(1..=8).contains(&m) {
            return Err(ApiError::validation(
                "max_agents_per_turn must be within [1, 8]",
            ));
        }
    }
    if let Some(k) = rag_top_k {
        if !(1..=10).contains(&k) {
            return Err(ApiError::validation("rag_top_k must be within [1, 10]"));
        }
    }
    Ok(())
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /personas - Create a persona.
#[utoipa::path(
    post,
    path = "/personas",
    tag = "Personas",
    request_body = CreatePersonaRequest,
    responses(
        (status = 201, description = "Persona created", body = PersonaResponse),
        (status = 400, description = "Invalid fields"),
        (status = 403, description = "Referenced profile belongs to another account"),
    )
)]
pub async fn create_persona(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreatePersonaRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate()?;
    let persona = state
        .personas
        .create_persona(NewPersona {
            owner: auth.username,
            display_name: req.display_name,
            handle: req.handle,
            system_prompt: req.system_prompt,
            tone: req.tone,
            proactivity: req.proactivity,
            memory_window: req.memory_window,
            max_agents_per_turn: req.max_agents_per_turn,
            api_profile_id: req.api_profile_id,
            embedding_profile_id: req.embedding_profile_id,
            is_default: req.is_default,
            background_text: req.background_text,
            rag_top_k: req.rag_top_k,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(PersonaResponse::from(persona))))
}

/// GET /personas - List the caller's personas.
#[utoipa::path(
    get,
    path = "/personas",
    tag = "Personas",
    responses((status = 200, description = "Personas", body = [PersonaResponse]))
)]
pub async fn list_personas(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<Vec<PersonaResponse>>> {
    let personas = state.personas.list_personas(&auth.username).await?;
    Ok(Json(personas.into_iter().map(Into::into).collect()))
}

/// GET /personas/{id} - Fetch one persona.
#[utoipa::path(
    get,
    path = "/personas/{id}",
    tag = "Personas",
    responses(
        (status = 200, description = "Persona", body = PersonaResponse),
        (status = 404, description = "Persona not found"),
    )
)]
pub async fn get_persona(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<PersonaId>,
) -> ApiResult<Json<PersonaResponse>> {
    let persona = state.personas.get_persona(&auth.username, id).await?;
    Ok(Json(persona.into()))
}

/// PATCH /personas/{id} - Update a persona.
#[utoipa::path(
    patch,
    path = "/personas/{id}",
    tag = "Personas",
    request_body = UpdatePersonaRequest,
    responses(
        (status = 200, description = "Updated persona", body = PersonaResponse),
        (status = 400, description = "Invalid fields"),
        (status = 404, description = "Persona not found"),
    )
)]
pub async fn update_persona(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<PersonaId>,
    Json(req): Json<UpdatePersonaRequest>,
) -> ApiResult<Json<PersonaResponse>> {
    validate_ranges(
        req.proactivity,
        req.memory_window,
        req.max_agents_per_turn,
        req.rag_top_k,
    )?;
    let persona = state
        .personas
        .update_persona(
            &auth.username,
            id,
            PersonaPatch {
                display_name: req.display_name,
                handle: req.handle,
                system_prompt: req.system_prompt,
                tone: req.tone,
                proactivity: req.proactivity,
                memory_window: req.memory_window,
                max_agents_per_turn: req.max_agents_per_turn,
                api_profile_id: req.api_profile_id.map(Some),
                embedding_profile_id: req.embedding_profile_id.map(Some),
                is_default: req.is_default,
                background_text: req.background_text.map(Some),
                rag_top_k: req.rag_top_k,
            },
        )
        .await?;
    Ok(Json(persona.into()))
}

/// DELETE /personas/{id} - Delete a persona and its knowledge base.
#[utoipa::path(
    delete,
    path = "/personas/{id}",
    tag = "Personas",
    responses(
        (status = 204, description = "Persona deleted"),
        (status = 404, description = "Persona not found"),
    )
)]
pub async fn delete_persona(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<PersonaId>,
) -> ApiResult<StatusCode> {
    let persona = state.personas.get_persona(&auth.username, id).await?;
    state
        .retrieval
        .delete_collection(&persona.collection_name())
        .await?;
    state.personas.delete_persona(&auth.username, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /personas/{id}/ingest-text - Feed raw text into the persona's
/// knowledge base.
#[utoipa::path(
    post,
    path = "/personas/{id}/ingest-text",
    tag = "Personas",
    request_body = IngestTextRequest,
    responses(
        (status = 200, description = "Ingestion report", body = IngestResponse),
        (status = 400, description = "Empty text"),
        (status = 404, description = "Persona not found"),
        (status = 500, description = "Persona has no embedding profile"),
    )
)]
pub async fn ingest_text(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<PersonaId>,
    Json(req): Json<IngestTextRequest>,
) -> ApiResult<Json<IngestResponse>> {
    if req.text.trim().is_empty() {
        return Err(ApiError::validation("text must not be empty"));
    }
    let persona = state.personas.get_persona(&auth.username, id).await?;
    let embed = state.personas.resolve_embedding_config(&persona).await?;
    let source = req.source.as_deref().unwrap_or(DEFAULT_TEXT_SOURCE);

    let report = state
        .retrieval
        .ingest_text(&persona.collection_name(), &embed, &req.text, source)
        .await?;
    Ok(Json(IngestResponse {
        chunks_added: report.chunks_added,
        collection: report.collection,
    }))
}

/// POST /personas/{id}/ingest-url - Fetch a URL and ingest its text.
#[utoipa::path(
    post,
    path = "/personas/{id}/ingest-url",
    tag = "Personas",
    request_body = IngestUrlRequest,
    responses(
        (status = 200, description = "Ingestion report", body = IngestResponse),
        (status = 400, description = "Invalid URL"),
        (status = 404, description = "Persona not found"),
        (status = 502, description = "Fetch failed"),
    )
)]
pub async fn ingest_url(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<PersonaId>,
    Json(req): Json<IngestUrlRequest>,
) -> ApiResult<Json<IngestResponse>> {
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(ApiError::validation("url must be http(s)"));
    }
    let persona = state.personas.get_persona(&auth.username, id).await?;
    let embed = state.personas.resolve_embedding_config(&persona).await?;

    let report = state
        .retrieval
        .ingest_url(&persona.collection_name(), &embed, &req.url)
        .await?;
    Ok(Json(IngestResponse {
        chunks_added: report.chunks_added,
        collection: report.collection,
    }))
}

/// POST /personas/{id}/refresh-rag - Re-ingest the persona's stored
/// background text, replacing the previous background chunks.
#[utoipa::path(
    post,
    path = "/personas/{id}/refresh-rag",
    tag = "Personas",
    responses(
        (status = 200, description = "Ingestion report", body = IngestResponse),
        (status = 400, description = "Persona has no background text"),
        (status = 404, description = "Persona not found"),
    )
)]
pub async fn refresh_rag(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<PersonaId>,
) -> ApiResult<Json<IngestResponse>> {
    let persona = state.personas.get_persona(&auth.username, id).await?;
    let background = persona
        .background_text
        .clone()
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| ApiError::validation("persona has no background text"))?;
    let embed = state.personas.resolve_embedding_config(&persona).await?;

    let report = state
        .retrieval
        .ingest_text(
            &persona.collection_name(),
            &embed,
            &background,
            BACKGROUND_SOURCE,
        )
        .await?;
    Ok(Json(IngestResponse {
        chunks_added: report.chunks_added,
        collection: report.collection,
    }))
}

// ============================================================================
// ROUTER SETUP
// ============================================================================

/// Create the persona routes router.
pub fn create_router() -> axum::Router<AppState> {
    use axum::routing::{get, post};
    axum::Router::new()
        .route("/", post(create_persona).get(list_personas))
        .route(
            "/:id",
            get(get_persona).patch(update_persona).delete(delete_persona),
        )
        .route("/:id/ingest-text", post(ingest_text))
        .route("/:id/ingest-url", post(ingest_url))
        .route("/:id/refresh-rag", post(refresh_rag))
}
