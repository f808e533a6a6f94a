//! API-Profile REST API Routes
//!
//! Keys are write-only: requests carry plaintext, responses only ever
//! carry the `"****" + last4` preview. Deleting a profile cascades its
//! dependent personas, dropping their knowledge collections first.

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
use parley_core::{ApiProfile, ProfileId};
use parley_store::{ApiProfilePatch, NewApiProfile};

const MIN_API_KEY_LEN: usize = 8;

// ============================================================================
// DTOS
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProfileRequest {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: Option<f64>,
    #[serde(default)]
    pub is_embedding_model: bool,
    pub embedding_dim: Option<u32>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f64>,
    pub is_embedding_model: Option<bool>,
    pub embedding_dim: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProfileResponse {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Always `"****" + last4`; the key itself is never returned.
    pub api_key_preview: String,
    pub temperature: Option<f64>,
    pub is_embedding_model: bool,
    pub embedding_dim: Option<u32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<ApiProfile> for ProfileResponse {
    fn from(profile: ApiProfile) -> Self {
        Self {
            id: profile.id,
            owner: profile.owner,
            name: profile.name,
            base_url: profile.base_url,
            model: profile.model,
            api_key_preview: profile.api_key_preview,
            temperature: profile.temperature,
            is_embedding_model: profile.is_embedding_model,
            embedding_dim: profile.embedding_dim,
            created_at: profile.created_at,
        }
    }
}

fn validate_common(
    name: Option<&str>,
    base_url: Option<&str>,
    api_key: Option<&str>,
    temperature: Option<f64>,
) -> Result<(), ApiError> {
    if let Some(name) = name {
        if name.trim().is_empty() {
            return Err(ApiError::validation("name must not be empty"));
        }
    }
    if let Some(base_url) = base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiError::validation("base_url must be http(s)"));
        }
    }
    if let Some(api_key) = api_key {
        if api_key.len() < MIN_API_KEY_LEN {
            return Err(ApiError::validation(format!(
                "api_key must be at least {} characters",
                MIN_API_KEY_LEN
            )));
        }
    }
    if let Some(temperature) = temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ApiError::validation("temperature must be within [0, 2]"));
        }
    }
    Ok(())
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /api-profiles - Register an upstream endpoint.
#[utoipa::path(
    post,
    path = "/api-profiles",
    tag = "ApiProfiles",
    request_body = CreateProfileRequest,
    responses(
        (status = 201, description = "Profile created", body = ProfileResponse),
        (status = 400, description = "Invalid fields"),
    )
)]
pub async fn create_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_common(
        Some(&req.name),
        Some(&req.base_url),
        Some(&req.api_key),
        req.temperature,
    )?;
    let profile = state
        .personas
        .create_api_profile(NewApiProfile {
            owner: auth.username,
            name: req.name,
            base_url: req.base_url,
            model: req.model,
            api_key: req.api_key,
            temperature: req.temperature,
            is_embedding_model: req.is_embedding_model,
            embedding_dim: req.embedding_dim,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ProfileResponse::from(profile))))
}

/// GET /api-profiles - List the caller's profiles.
#[utoipa::path(
    get,
    path = "/api-profiles",
    tag = "ApiProfiles",
    responses((status = 200, description = "Profiles", body = [ProfileResponse]))
)]
pub async fn list_profiles(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<Vec<ProfileResponse>>> {
    let profiles = state.personas.list_api_profiles(&auth.username).await?;
    Ok(Json(profiles.into_iter().map(Into::into).collect()))
}

/// GET /api-profiles/{id} - Fetch one profile.
#[utoipa::path(
    get,
    path = "/api-profiles/{id}",
    tag = "ApiProfiles",
    responses(
        (status = 200, description = "Profile", body = ProfileResponse),
        (status = 404, description = "Profile not found"),
    )
)]
pub async fn get_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<ProfileId>,
) -> ApiResult<Json<ProfileResponse>> {
    let profile = state.personas.get_api_profile(&auth.username, id).await?;
    Ok(Json(profile.into()))
}

/// PATCH /api-profiles/{id} - Update a profile; the key is replaced
/// wholesale when present.
#[utoipa::path(
    patch,
    path = "/api-profiles/{id}",
    tag = "ApiProfiles",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Updated profile", body = ProfileResponse),
        (status = 400, description = "Invalid fields"),
        (status = 404, description = "Profile not found"),
    )
)]
pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<ProfileId>,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<ProfileResponse>> {
    validate_common(
        req.name.as_deref(),
        req.base_url.as_deref(),
        req.api_key.as_deref(),
        req.temperature,
    )?;
    let profile = state
        .personas
        .update_api_profile(
            &auth.username,
            id,
            ApiProfilePatch {
                name: req.name,
                base_url: req.base_url,
                model: req.model,
                api_key: req.api_key,
                temperature: req.temperature,
                is_embedding_model: req.is_embedding_model,
                embedding_dim: req.embedding_dim,
            },
        )
        .await?;
    Ok(Json(profile.into()))
}

/// DELETE /api-profiles/{id} - Delete a profile and its dependent
/// personas (including their knowledge collections).
#[utoipa::path(
    delete,
    path = "/api-profiles/{id}",
    tag = "ApiProfiles",
    responses(
        (status = 204, description = "Profile deleted"),
        (status = 404, description = "Profile not found"),
    )
)]
pub async fn delete_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<ProfileId>,
) -> ApiResult<StatusCode> {
    let dependents = state
        .personas
        .list_personas_for_profile(&auth.username, id)
        .await?;
    for persona in &dependents {
        state
            .retrieval
            .delete_collection(&persona.collection_name())
            .await?;
    }
    state.personas.delete_api_profile(&auth.username, id).await?;
    tracing::info!(
        profile_id = id,
        cascaded = dependents.len(),
        "api profile deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// ROUTER SETUP
// ============================================================================

/// Create the api-profile routes router.
pub fn create_router() -> axum::Router<AppState> {
    use axum::routing::{get, post};
    axum::Router::new()
        .route("/", post(create_profile).get(list_profiles))
        .route(
            "/:id",
            get(get_profile).patch(update_profile).delete(delete_profile),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_length_validation() {
        assert!(validate_common(None, None, Some("short"), None).is_err());
        assert!(validate_common(None, None, Some("long-enough-key"), None).is_ok());
    }

    #[test]
    fn test_temperature_range() {
        assert!(validate_common(None, None, None, Some(2.5)).is_err());
        assert!(validate_common(None, None, None, Some(0.0)).is_ok());
    }

    #[test]
    fn test_base_url_scheme() {
        assert!(validate_common(None, Some("ftp://x"), None, None).is_err());
        assert!(validate_common(None, Some("https://api.example.com/v1"), None, None).is_ok());
    }

    #[test]
    fn test_response_never_contains_key_material() {
        let profile = ApiProfile {
            id: 1,
            owner: "alice".to_string(),
            name: "main".to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            model: "gpt-x".to_string(),
            encrypted_api_key: b"ciphertext".to_vec(),
            api_key_preview: "****3456".to_string(),
            temperature: None,
            is_embedding_model: false,
            embedding_dim: None,
            created_at: chrono::Utc::now(),
        };
        let response = ProfileResponse::from(profile);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("****3456"));
        assert!(!json.contains("api_key\""));
        assert!(!json.contains("ciphertext"));
    }
}
