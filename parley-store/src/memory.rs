//! In-memory store implementation
//!
//! Backs the test suites and single-node development. Semantics match
//! the Postgres implementation, including owner scoping, cascades, and
//! message positions.

use crate::crypto::KeyCipher;
use crate::traits::{
    embedding_config_from, llm_config_from, missing_embedder, ApiProfilePatch, ConversationStore,
    NewApiProfile, NewPersona, NewSession, PersonaPatch, PersonaStore, SessionMetaPatch,
};
use async_trait::async_trait;
use chrono::Utc;
use parley_core::{
    slugify_handle, ApiProfile, EmbeddingConfig, LlmConfig, Message, ParleyError, Persona,
    PersonaId, ProfileId, Session, SessionId, StoreError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    profiles: HashMap<ProfileId, ApiProfile>,
    personas: HashMap<PersonaId, Persona>,
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
    next_profile_id: ProfileId,
    next_persona_id: PersonaId,
    next_message_id: i64,
}

/// Thread-safe in-memory store implementing both store traits.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    cipher: Arc<KeyCipher>,
}

impl InMemoryStore {
    pub fn new(cipher: Arc<KeyCipher>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_profile_id: 1,
                next_persona_id: 1,
                next_message_id: 1,
                ..Default::default()
            }),
            cipher,
        }
    }

    fn not_found(entity: &'static str, id: impl std::fmt::Display) -> StoreError {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// A persona may only reference profiles of its own owner.
    fn check_profile_ref(
        inner: &Inner,
        owner: &str,
        profile_id: Option<ProfileId>,
    ) -> Result<(), StoreError> {
        let Some(id) = profile_id else {
            return Ok(());
        };
        match inner.profiles.get(&id) {
            Some(profile) if profile.owner == owner => Ok(()),
            Some(_) => Err(StoreError::PermissionDenied {
                entity: "api_profile",
                id: id.to_string(),
            }),
            None => Err(Self::not_found("api_profile", id)),
        }
    }
}

#[async_trait]
impl PersonaStore for InMemoryStore {
    async fn create_api_profile(&self, req: NewApiProfile) -> Result<ApiProfile, StoreError> {
        let encrypted_api_key =
            self.cipher
                .encrypt(&req.api_key)
                .map_err(|e| StoreError::InsertFailed {
                    entity: "api_profile",
                    reason: e.to_string(),
                })?;

        let api_key_preview = crate::key_preview(&req.api_key);

        let mut inner = self.inner.lock().expect("store poisoned");
        let id = inner.next_profile_id;
        inner.next_profile_id += 1;

        let profile = ApiProfile {
            id,
            owner: req.owner,
            name: req.name,
            base_url: req.base_url,
            model: req.model,
            encrypted_api_key,
            api_key_preview,
            temperature: req.temperature,
            is_embedding_model: req.is_embedding_model,
            embedding_dim: req.embedding_dim,
            created_at: Utc::now(),
        };
        inner.profiles.insert(id, profile.clone());
        Ok(profile)
    }

    async fn get_api_profile(&self, owner: &str, id: ProfileId) -> Result<ApiProfile, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .profiles
            .get(&id)
            .filter(|p| p.owner == owner)
            .cloned()
            .ok_or_else(|| Self::not_found("api_profile", id))
    }

    async fn list_api_profiles(&self, owner: &str) -> Result<Vec<ApiProfile>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut profiles: Vec<ApiProfile> = inner
            .profiles
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        profiles.sort_by_key(|p| p.id);
        Ok(profiles)
    }

    async fn update_api_profile(
        &self,
        owner: &str,
        id: ProfileId,
        patch: ApiProfilePatch,
    ) -> Result<ApiProfile, StoreError> {
        let encrypted = match &patch.api_key {
            Some(key) => Some(self.cipher.encrypt(key).map_err(|e| StoreError::UpdateFailed {
                entity: "api_profile",
                id: id.to_string(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let mut inner = self.inner.lock().expect("store poisoned");
        let profile = inner
            .profiles
            .get_mut(&id)
            .filter(|p| p.owner == owner)
            .ok_or_else(|| Self::not_found("api_profile", id))?;

        if let Some(name) = patch.name {
            profile.name = name;
        }
        if let Some(base_url) = patch.base_url {
            profile.base_url = base_url;
        }
        if let Some(model) = patch.model {
            profile.model = model;
        }
        if let Some(blob) = encrypted {
            profile.encrypted_api_key = blob;
            if let Some(key) = &patch.api_key {
                profile.api_key_preview = crate::key_preview(key);
            }
        }
        if let Some(temperature) = patch.temperature {
            profile.temperature = Some(temperature);
        }
        if let Some(flag) = patch.is_embedding_model {
            profile.is_embedding_model = flag;
        }
        if let Some(dim) = patch.embedding_dim {
            profile.embedding_dim = Some(dim);
        }
        Ok(profile.clone())
    }

    async fn delete_api_profile(&self, owner: &str, id: ProfileId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let existed = inner
            .profiles
            .get(&id)
            .map(|p| p.owner == owner)
            .unwrap_or(false);
        if !existed {
            return Err(Self::not_found("api_profile", id));
        }
        inner.profiles.remove(&id);
        // Cascade dependent personas.
        inner
            .personas
            .retain(|_, p| p.api_profile_id != Some(id) && p.embedding_profile_id != Some(id));
        Ok(())
    }

    async fn create_persona(&self, req: NewPersona) -> Result<Persona, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        Self::check_profile_ref(&inner, &req.owner, req.api_profile_id)?;
        Self::check_profile_ref(&inner, &req.owner, req.embedding_profile_id)?;

        let handle = req
            .handle
            .clone()
            .unwrap_or_else(|| slugify_handle(&req.display_name));
        if inner
            .personas
            .values()
            .any(|p| p.owner == req.owner && p.handle == handle)
        {
            return Err(StoreError::InsertFailed {
                entity: "persona",
                reason: format!("handle '{}' already exists", handle),
            });
        }

        let id = inner.next_persona_id;
        inner.next_persona_id += 1;
        let persona = Persona {
            id,
            owner: req.owner,
            handle,
            display_name: req.display_name,
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
            created_at: Utc::now(),
        };
        inner.personas.insert(id, persona.clone());
        Ok(persona)
    }

    async fn get_persona(&self, owner: &str, id: PersonaId) -> Result<Persona, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .personas
            .get(&id)
            .filter(|p| p.owner == owner)
            .cloned()
            .ok_or_else(|| Self::not_found("persona", id))
    }

    async fn get_persona_by_handle(
        &self,
        owner: &str,
        handle: &str,
    ) -> Result<Persona, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .personas
            .values()
            .find(|p| p.owner == owner && p.handle == handle)
            .cloned()
            .ok_or_else(|| Self::not_found("persona", handle))
    }

    async fn list_personas(&self, owner: &str) -> Result<Vec<Persona>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut personas: Vec<Persona> = inner
            .personas
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        personas.sort_by_key(|p| p.id);
        Ok(personas)
    }

    async fn update_persona(
        &self,
        owner: &str,
        id: PersonaId,
        patch: PersonaPatch,
    ) -> Result<Persona, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if let Some(profile_ref) = patch.api_profile_id {
            Self::check_profile_ref(&inner, owner, profile_ref)?;
        }
        if let Some(profile_ref) = patch.embedding_profile_id {
            Self::check_profile_ref(&inner, owner, profile_ref)?;
        }

        let persona = inner
            .personas
            .get_mut(&id)
            .filter(|p| p.owner == owner)
            .ok_or_else(|| Self::not_found("persona", id))?;

        if let Some(display_name) = patch.display_name {
            persona.display_name = display_name;
        }
        if let Some(handle) = patch.handle {
            persona.handle = handle;
        }
        if let Some(system_prompt) = patch.system_prompt {
            persona.system_prompt = system_prompt;
        }
        if let Some(tone) = patch.tone {
            persona.tone = tone;
        }
        if let Some(proactivity) = patch.proactivity {
            persona.proactivity = proactivity;
        }
        if let Some(memory_window) = patch.memory_window {
            persona.memory_window = memory_window;
        }
        if let Some(max_agents) = patch.max_agents_per_turn {
            persona.max_agents_per_turn = max_agents;
        }
        if let Some(profile_ref) = patch.api_profile_id {
            persona.api_profile_id = profile_ref;
        }
        if let Some(profile_ref) = patch.embedding_profile_id {
            persona.embedding_profile_id = profile_ref;
        }
        if let Some(is_default) = patch.is_default {
            persona.is_default = is_default;
        }
        if let Some(background) = patch.background_text {
            persona.background_text = background;
        }
        if let Some(rag_top_k) = patch.rag_top_k {
            persona.rag_top_k = rag_top_k;
        }
        Ok(persona.clone())
    }

    async fn delete_persona(&self, owner: &str, id: PersonaId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let existed = inner
            .personas
            .get(&id)
            .map(|p| p.owner == owner)
            .unwrap_or(false);
        if !existed {
            return Err(Self::not_found("persona", id));
        }
        inner.personas.remove(&id);
        Ok(())
    }

    async fn list_personas_for_profile(
        &self,
        owner: &str,
        profile_id: ProfileId,
    ) -> Result<Vec<Persona>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .personas
            .values()
            .filter(|p| {
                p.owner == owner
                    && (p.api_profile_id == Some(profile_id)
                        || p.embedding_profile_id == Some(profile_id))
            })
            .cloned()
            .collect())
    }

    async fn resolve_llm_config(&self, persona: &Persona) -> Result<LlmConfig, ParleyError> {
        let profile_id = persona.api_profile_id.ok_or_else(|| {
            ParleyError::Config(parley_core::ConfigError::MissingRequired {
                field: "api_profile_id".to_string(),
            })
        })?;
        let profile = self.get_api_profile(&persona.owner, profile_id).await?;
        llm_config_from(&profile, &self.cipher)
    }

    async fn resolve_embedding_config(
        &self,
        persona: &Persona,
    ) -> Result<EmbeddingConfig, ParleyError> {
        let profile_id = persona.embedding_profile_id.ok_or_else(missing_embedder)?;
        let profile = self.get_api_profile(&persona.owner, profile_id).await?;
        embedding_config_from(&profile, &self.cipher)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_session(&self, meta: NewSession) -> Result<Session, StoreError> {
        let id = SessionId::generate(&meta.owner).map_err(|e| StoreError::InsertFailed {
            entity: "session",
            reason: e.to_string(),
        })?;
        let session = Session {
            id: id.clone(),
            owner: meta.owner,
            title: meta.title,
            user_display_name: meta.user_display_name,
            user_handle: meta.user_handle,
            user_persona: meta.user_persona,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.sessions.insert(id.as_str().to_string(), session.clone());
        inner.messages.insert(id.as_str().to_string(), Vec::new());
        Ok(session)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sessions
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| Self::not_found("session", id))
    }

    async fn list_sessions(&self, owner: &str) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn update_session_meta(
        &self,
        id: &SessionId,
        patch: SessionMetaPatch,
    ) -> Result<Session, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let session = inner
            .sessions
            .get_mut(id.as_str())
            .ok_or_else(|| Self::not_found("session", id))?;
        if let Some(title) = patch.title {
            session.title = Some(title);
        }
        if let Some(name) = patch.user_display_name {
            session.user_display_name = Some(name);
        }
        if let Some(handle) = patch.user_handle {
            session.user_handle = Some(handle);
        }
        if let Some(persona) = patch.user_persona {
            session.user_persona = Some(persona);
        }
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if inner.sessions.remove(id.as_str()).is_none() {
            return Err(Self::not_found("session", id));
        }
        inner.messages.remove(id.as_str());
        Ok(())
    }

    async fn delete_sessions(&self, ids: &[SessionId], owner: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let mut deleted = 0;
        for id in ids {
            let owned = inner
                .sessions
                .get(id.as_str())
                .map(|s| s.owner == owner)
                .unwrap_or(false);
            if owned {
                inner.sessions.remove(id.as_str());
                inner.messages.remove(id.as_str());
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        sender: &str,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if !inner.sessions.contains_key(session_id.as_str()) {
            return Err(Self::not_found("session", session_id));
        }
        let id = inner.next_message_id;
        inner.next_message_id += 1;

        let log = inner
            .messages
            .entry(session_id.as_str().to_string())
            .or_default();
        let message = Message {
            id,
            session_id: session_id.clone(),
            sender: sender.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            position: log.len() as i64,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        if !inner.sessions.contains_key(session_id.as_str()) {
            return Err(Self::not_found("session", session_id));
        }
        let log = inner
            .messages
            .get(session_id.as_str())
            .cloned()
            .unwrap_or_default();
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Arc::new(KeyCipher::from_secret("test-key").unwrap()))
    }

    fn profile_req(owner: &str) -> NewApiProfile {
        NewApiProfile {
            owner: owner.to_string(),
            name: "main".to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            model: "gpt-x".to_string(),
            api_key: "sk-abcdef123456".to_string(),
            temperature: Some(0.4),
            is_embedding_model: false,
            embedding_dim: None,
        }
    }

    fn persona_req(owner: &str, profile: Option<ProfileId>) -> NewPersona {
        NewPersona {
            owner: owner.to_string(),
            display_name: "Alice Agent".to_string(),
            handle: None,
            system_prompt: "You are Alice.".to_string(),
            tone: "warm".to_string(),
            proactivity: 0.5,
            memory_window: 8,
            max_agents_per_turn: 2,
            api_profile_id: profile,
            embedding_profile_id: None,
            is_default: false,
            background_text: None,
            rag_top_k: 3,
        }
    }

    #[tokio::test]
    async fn test_profile_round_trip_and_decryption() {
        let store = store();
        let profile = store.create_api_profile(profile_req("alice")).await.unwrap();
        let persona = store
            .create_persona(persona_req("alice", Some(profile.id)))
            .await
            .unwrap();
        assert_eq!(persona.handle, "alice_agent");

        let config = store.resolve_llm_config(&persona).await.unwrap();
        assert_eq!(config.api_key, "sk-abcdef123456");
        assert_eq!(config.model, "gpt-x");
    }

    #[tokio::test]
    async fn test_cross_owner_profile_reference_denied() {
        let store = store();
        let profile = store.create_api_profile(profile_req("alice")).await.unwrap();
        let err = store
            .create_persona(persona_req("bob", Some(profile.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_profile_is_owner_scoped() {
        let store = store();
        let profile = store.create_api_profile(profile_req("alice")).await.unwrap();
        let err = store.get_api_profile("bob", profile.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_profile_delete_cascades_personas() {
        let store = store();
        let profile = store.create_api_profile(profile_req("alice")).await.unwrap();
        let persona = store
            .create_persona(persona_req("alice", Some(profile.id)))
            .await
            .unwrap();

        store.delete_api_profile("alice", profile.id).await.unwrap();
        let err = store.get_persona("alice", persona.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_handle_rejected() {
        let store = store();
        store.create_persona(persona_req("alice", None)).await.unwrap();
        let err = store
            .create_persona(persona_req("alice", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InsertFailed { .. }));
    }

    #[tokio::test]
    async fn test_message_positions_increase() {
        let store = store();
        let session = store
            .create_session(NewSession {
                owner: "alice".to_string(),
                title: None,
                user_display_name: None,
                user_handle: None,
                user_persona: None,
            })
            .await
            .unwrap();

        let m1 = store
            .append_message(&session.id, "user", "first")
            .await
            .unwrap();
        let m2 = store
            .append_message(&session.id, "user", "second")
            .await
            .unwrap();
        assert!(m1.position < m2.position);
        assert!(m1.created_at <= m2.created_at);

        let messages = store.list_messages(&session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
    }

    #[tokio::test]
    async fn test_list_messages_truncates_to_recent() {
        let store = store();
        let session = store
            .create_session(NewSession {
                owner: "alice".to_string(),
                title: None,
                user_display_name: None,
                user_handle: None,
                user_persona: None,
            })
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_message(&session.id, "user", &format!("m{}", i))
                .await
                .unwrap();
        }
        let messages = store.list_messages(&session.id, 2).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "m3");
        assert_eq!(messages[1].content, "m4");
    }

    #[tokio::test]
    async fn test_delete_session_cascades_messages() {
        let store = store();
        let session = store
            .create_session(NewSession {
                owner: "alice".to_string(),
                title: None,
                user_display_name: None,
                user_handle: None,
                user_persona: None,
            })
            .await
            .unwrap();
        store
            .append_message(&session.id, "user", "hello")
            .await
            .unwrap();
        store.delete_session(&session.id).await.unwrap();
        assert!(store.list_messages(&session.id, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_delete_skips_foreign_sessions() {
        let store = store();
        let alice = store
            .create_session(NewSession {
                owner: "alice".to_string(),
                title: None,
                user_display_name: None,
                user_handle: None,
                user_persona: None,
            })
            .await
            .unwrap();
        let bob = store
            .create_session(NewSession {
                owner: "bob".to_string(),
                title: None,
                user_display_name: None,
                user_handle: None,
                user_persona: None,
            })
            .await
            .unwrap();

        let deleted = store
            .delete_sessions(&[alice.id.clone(), bob.id.clone()], "alice")
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_session(&bob.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_embedder_is_config_error() {
        let store = store();
        let persona = store.create_persona(persona_req("alice", None)).await.unwrap();
        let err = store.resolve_embedding_config(&persona).await.unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
    }
}
