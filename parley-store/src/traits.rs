//! Store traits and request types

use async_trait::async_trait;
use parley_core::{
    ApiProfile, EmbeddingConfig, LlmConfig, Message, ParleyError, Persona, PersonaId, ProfileId,
    Session, SessionId, StoreError,
};

/// Fallback vector dimension for embedding profiles that do not declare
/// one.
pub(crate) const DEFAULT_EMBEDDING_DIM: usize = 1536;

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// Input for `create_api_profile`. The key arrives in plaintext and is
/// encrypted before it touches storage.
#[derive(Debug, Clone)]
pub struct NewApiProfile {
    pub owner: String,
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: Option<f64>,
    pub is_embedding_model: bool,
    pub embedding_dim: Option<u32>,
}

/// Partial update for an API profile; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ApiProfilePatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f64>,
    pub is_embedding_model: Option<bool>,
    pub embedding_dim: Option<u32>,
}

/// Input for `create_persona`.
#[derive(Debug, Clone)]
pub struct NewPersona {
    pub owner: String,
    pub display_name: String,
    /// Slugified from `display_name` when absent.
    pub handle: Option<String>,
    pub system_prompt: String,
    pub tone: String,
    pub proactivity: f64,
    pub memory_window: usize,
    pub max_agents_per_turn: usize,
    pub api_profile_id: Option<ProfileId>,
    pub embedding_profile_id: Option<ProfileId>,
    pub is_default: bool,
    pub background_text: Option<String>,
    pub rag_top_k: usize,
}

/// Partial update for a persona.
#[derive(Debug, Clone, Default)]
pub struct PersonaPatch {
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub system_prompt: Option<String>,
    pub tone: Option<String>,
    pub proactivity: Option<f64>,
    pub memory_window: Option<usize>,
    pub max_agents_per_turn: Option<usize>,
    pub api_profile_id: Option<Option<ProfileId>>,
    pub embedding_profile_id: Option<Option<ProfileId>>,
    pub is_default: Option<bool>,
    pub background_text: Option<Option<String>>,
    pub rag_top_k: Option<usize>,
}

/// Input for `create_session`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner: String,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

/// Partial update for session metadata.
#[derive(Debug, Clone, Default)]
pub struct SessionMetaPatch {
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

// ============================================================================
// CONFIG RESOLUTION HELPERS
// ============================================================================

/// Build a chat [`LlmConfig`] from a profile, decrypting its key.
pub(crate) fn llm_config_from(
    profile: &ApiProfile,
    cipher: &crate::KeyCipher,
) -> Result<LlmConfig, ParleyError> {
    let api_key = cipher.decrypt(&profile.encrypted_api_key)?;
    Ok(LlmConfig {
        base_url: profile.base_url.clone(),
        model: profile.model.clone(),
        api_key,
        temperature: profile.temperature,
    })
}

/// Build an [`EmbeddingConfig`] from an embedding-capable profile.
pub(crate) fn embedding_config_from(
    profile: &ApiProfile,
    cipher: &crate::KeyCipher,
) -> Result<EmbeddingConfig, ParleyError> {
    let api_key = cipher.decrypt(&profile.encrypted_api_key)?;
    Ok(EmbeddingConfig {
        base_url: profile.base_url.clone(),
        model: profile.model.clone(),
        api_key,
        dimension: profile
            .embedding_dim
            .map(|d| d as usize)
            .unwrap_or(DEFAULT_EMBEDDING_DIM),
    })
}

/// The `ConfigError` raised when a persona needs an embedder but has
/// none configured.
pub(crate) fn missing_embedder() -> ParleyError {
    parley_core::ConfigError::MissingRequired {
        field: "embedding_profile_id".to_string(),
    }
    .into()
}

// ============================================================================
// PERSONA STORE
// ============================================================================

/// CRUD over personas and API profiles, scoped by owner, plus the
/// config-resolution helpers that decrypt keys on demand.
#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn create_api_profile(&self, req: NewApiProfile) -> Result<ApiProfile, StoreError>;
    async fn get_api_profile(&self, owner: &str, id: ProfileId) -> Result<ApiProfile, StoreError>;
    async fn list_api_profiles(&self, owner: &str) -> Result<Vec<ApiProfile>, StoreError>;
    async fn update_api_profile(
        &self,
        owner: &str,
        id: ProfileId,
        patch: ApiProfilePatch,
    ) -> Result<ApiProfile, StoreError>;
    /// Deleting a profile cascades its dependent personas.
    async fn delete_api_profile(&self, owner: &str, id: ProfileId) -> Result<(), StoreError>;

    async fn create_persona(&self, req: NewPersona) -> Result<Persona, StoreError>;
    async fn get_persona(&self, owner: &str, id: PersonaId) -> Result<Persona, StoreError>;
    async fn get_persona_by_handle(&self, owner: &str, handle: &str)
        -> Result<Persona, StoreError>;
    async fn list_personas(&self, owner: &str) -> Result<Vec<Persona>, StoreError>;
    async fn update_persona(
        &self,
        owner: &str,
        id: PersonaId,
        patch: PersonaPatch,
    ) -> Result<Persona, StoreError>;
    async fn delete_persona(&self, owner: &str, id: PersonaId) -> Result<(), StoreError>;

    /// Personas whose api or embedding profile is the given one. Used to
    /// clean up retrieval collections before a cascading profile delete.
    async fn list_personas_for_profile(
        &self,
        owner: &str,
        profile_id: ProfileId,
    ) -> Result<Vec<Persona>, StoreError>;

    /// Decrypt the persona's chat endpoint configuration. The plaintext
    /// key lives only in the returned value.
    async fn resolve_llm_config(&self, persona: &Persona) -> Result<LlmConfig, ParleyError>;

    /// Decrypt the persona's embedding endpoint configuration.
    async fn resolve_embedding_config(
        &self,
        persona: &Persona,
    ) -> Result<EmbeddingConfig, ParleyError>;
}

// ============================================================================
// CONVERSATION STORE
// ============================================================================

/// Sessions and their ordered, append-only message logs.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_session(&self, meta: NewSession) -> Result<Session, StoreError>;
    async fn get_session(&self, id: &SessionId) -> Result<Session, StoreError>;
    async fn list_sessions(&self, owner: &str) -> Result<Vec<Session>, StoreError>;
    async fn update_session_meta(
        &self,
        id: &SessionId,
        patch: SessionMetaPatch,
    ) -> Result<Session, StoreError>;
    /// Cascades the session's messages.
    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError>;
    /// Bulk delete; ids not owned by `owner` are skipped. Returns the
    /// number actually deleted.
    async fn delete_sessions(&self, ids: &[SessionId], owner: &str) -> Result<usize, StoreError>;

    /// Atomic append; assigns a monotonically increasing position.
    async fn append_message(
        &self,
        session_id: &SessionId,
        sender: &str,
        content: &str,
    ) -> Result<Message, StoreError>;
    /// Ascending time order, truncated to the most recent `limit`.
    async fn list_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}
