//! Core entity structures

use crate::{MessageRowId, PersonaId, ProfileId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

/// Default number of knowledge passages retrieved per query.
pub const DEFAULT_RAG_TOP_K: usize = 3;

/// An upstream OpenAI-compatible endpoint owned by one account.
///
/// The key is stored encrypted; plaintext only exists inside
/// `resolve_llm_config` on the store side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiProfile {
    pub id: ProfileId,
    pub owner: String,
    pub name: String,
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing, default)]
    pub encrypted_api_key: Vec<u8>,
    /// `"****" + last4`, computed at write time; the only key-derived
    /// value that ever reaches clients.
    pub api_key_preview: String,
    pub temperature: Option<f64>,
    pub is_embedding_model: bool,
    pub embedding_dim: Option<u32>,
    pub created_at: Timestamp,
}

/// One participant in a group chat: a prompt-and-config bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: PersonaId,
    pub owner: String,
    /// Slug unique per owner; derived from the display name when absent.
    pub handle: String,
    pub display_name: String,
    pub system_prompt: String,
    pub tone: String,
    /// Baseline bias toward speaking up, in `[0, 1]`.
    pub proactivity: f64,
    pub memory_window: usize,
    pub max_agents_per_turn: usize,
    pub api_profile_id: Option<ProfileId>,
    /// Embedding-capable profile backing this persona's knowledge base.
    pub embedding_profile_id: Option<ProfileId>,
    pub is_default: bool,
    pub background_text: Option<String>,
    pub rag_top_k: usize,
    pub created_at: Timestamp,
}

impl Persona {
    /// Name of this persona's retrieval collection.
    ///
    /// A pure function of `(owner, id)`; the collection exists iff the
    /// persona has ingested at least one document.
    pub fn collection_name(&self) -> String {
        collection_name(&self.owner, self.id)
    }
}

/// Derive the retrieval collection name for a persona.
pub fn collection_name(owner: &str, persona_id: PersonaId) -> String {
    format!("{}_persona_{}_rag", owner, persona_id)
}

/// Derive a handle slug from a display name: lowercased, runs of
/// non-alphanumerics collapsed to a single underscore.
pub fn slugify_handle(display_name: &str) -> String {
    let mut out = String::with_capacity(display_name.len());
    let mut last_was_sep = true;
    for ch in display_name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "persona".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A long-lived conversation with a fixed owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner: String,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    /// Sender tag for user-authored messages; defaults to "user".
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
    pub created_at: Timestamp,
}

impl Session {
    /// The sender tag under which this session's user messages are stored.
    pub fn user_sender(&self) -> &str {
        self.user_handle.as_deref().unwrap_or("user")
    }
}

/// One committed entry in a session's message log. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageRowId,
    pub session_id: SessionId,
    pub sender: String,
    pub content: String,
    pub created_at: Timestamp,
    /// Monotone insertion order within the session; tiebreaker when
    /// timestamps collide.
    pub position: i64,
}

/// Decrypted connection parameters for one LLM call.
///
/// Materialized only inside the call frame that dispatches to the
/// provider; never logged, never serialized.
#[derive(Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: Option<f64>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Resolved embedding endpoint for a persona's knowledge base.
#[derive(Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub dimension: usize,
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("dimension", &self.dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_format() {
        assert_eq!(collection_name("alice", 7), "alice_persona_7_rag");
    }

    #[test]
    fn test_slugify_handle() {
        assert_eq!(slugify_handle("Madame Maid"), "madame_maid");
        assert_eq!(slugify_handle("  Dr. Who?! "), "dr_who");
        assert_eq!(slugify_handle("分析師 Bob"), "分析師_bob");
        assert_eq!(slugify_handle("!!!"), "persona");
    }

    #[test]
    fn test_llm_config_debug_redacts_key() {
        let config = LlmConfig {
            base_url: "https://api.example.com/v1".to_string(),
            model: "gpt-x".to_string(),
            api_key: "sk-verysecret".to_string(),
            temperature: Some(0.4),
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("verysecret"));
    }

    #[test]
    fn test_user_sender_defaults() {
        let session = Session {
            id: SessionId::generate("alice").unwrap(),
            owner: "alice".to_string(),
            title: None,
            user_display_name: None,
            user_handle: None,
            user_persona: None,
            created_at: chrono::Utc::now(),
        };
        assert_eq!(session.user_sender(), "user");
    }

    #[test]
    fn test_encrypted_key_not_serialized() {
        let profile = ApiProfile {
            id: 1,
            owner: "alice".to_string(),
            name: "main".to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            model: "gpt-x".to_string(),
            encrypted_api_key: vec![1, 2, 3],
            api_key_preview: "****3456".to_string(),
            temperature: None,
            is_embedding_model: false,
            embedding_dim: None,
            created_at: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&profile).unwrap();
        assert!(!json.contains("encrypted_api_key"));
    }
}
