//! PostgreSQL store implementation
//!
//! Connection pooling via deadpool-postgres; plain SQL with positional
//! parameters. The schema is applied idempotently at startup (schema
//! migration tooling is a deployment concern, not this crate's).

use crate::crypto::KeyCipher;
use crate::traits::{
    embedding_config_from, llm_config_from, missing_embedder, ApiProfilePatch, ConversationStore,
    NewApiProfile, NewPersona, NewSession, PersonaPatch, PersonaStore, SessionMetaPatch,
};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parley_core::{
    slugify_handle, ApiProfile, EmbeddingConfig, LlmConfig, Message, ParleyError, Persona,
    PersonaId, ProfileId, Session, SessionId, StoreError,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio_postgres::{NoTls, Row};
use tracing::info;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Maximum pool size.
    pub max_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://postgres@localhost:5432/parley".to_string(),
            max_size: 16,
        }
    }
}

impl DbConfig {
    /// Create configuration from environment variables.
    ///
    /// - `PARLEY_DATABASE_URL`: connection string
    ///   (default: postgres://postgres@localhost:5432/parley)
    /// - `PARLEY_DB_POOL_SIZE`: maximum pool size (default: 16)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("PARLEY_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            max_size: std::env::var("PARLEY_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> Result<Pool, StoreError> {
        let pg_config = tokio_postgres::Config::from_str(&self.database_url).map_err(|e| {
            StoreError::Database {
                reason: format!("invalid database url: {}", e),
            }
        })?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(manager)
            .max_size(self.max_size)
            .build()
            .map_err(|e| StoreError::Database {
                reason: format!("failed to build pool: {}", e),
            })
    }
}

// ============================================================================
// STORE
// ============================================================================

/// PostgreSQL-backed implementation of both store traits.
pub struct PgStore {
    pool: Pool,
    cipher: Arc<KeyCipher>,
}

impl PgStore {
    pub fn new(pool: Pool, cipher: Arc<KeyCipher>) -> Self {
        Self { pool, cipher }
    }

    pub fn from_config(config: &DbConfig, cipher: Arc<KeyCipher>) -> Result<Self, StoreError> {
        Ok(Self::new(config.create_pool()?, cipher))
    }

    /// Apply the schema idempotently.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .map_err(db_err)?;
        info!("database schema ensured");
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool.get().await.map_err(|e| StoreError::Database {
            reason: format!("pool: {}", e),
        })
    }

    fn profile_from_row(row: &Row) -> ApiProfile {
        ApiProfile {
            id: row.get("id"),
            owner: row.get("owner"),
            name: row.get("name"),
            base_url: row.get("base_url"),
            model: row.get("model"),
            encrypted_api_key: row.get("encrypted_api_key"),
            api_key_preview: row.get("api_key_preview"),
            temperature: row.get("temperature"),
            is_embedding_model: row.get("is_embedding_model"),
            embedding_dim: row.get::<_, Option<i32>>("embedding_dim").map(|d| d as u32),
            created_at: row.get("created_at"),
        }
    }

    fn persona_from_row(row: &Row) -> Persona {
        Persona {
            id: row.get("id"),
            owner: row.get("owner"),
            handle: row.get("handle"),
            display_name: row.get("display_name"),
            system_prompt: row.get("system_prompt"),
            tone: row.get("tone"),
            proactivity: row.get("proactivity"),
            memory_window: row.get::<_, i32>("memory_window").max(1) as usize,
            max_agents_per_turn: row.get::<_, i32>("max_agents_per_turn").max(1) as usize,
            api_profile_id: row.get("api_profile_id"),
            embedding_profile_id: row.get("embedding_profile_id"),
            is_default: row.get("is_default"),
            background_text: row.get("background_text"),
            rag_top_k: row.get::<_, i32>("rag_top_k").max(1) as usize,
            created_at: row.get("created_at"),
        }
    }

    fn session_from_row(row: &Row) -> Result<Session, StoreError> {
        let raw: String = row.get("id");
        let id = SessionId::parse(&raw).map_err(|e| StoreError::Database {
            reason: format!("stored session id '{}' is malformed: {}", raw, e),
        })?;
        Ok(Session {
            id,
            owner: row.get("owner"),
            title: row.get("title"),
            user_display_name: row.get("user_display_name"),
            user_handle: row.get("user_handle"),
            user_persona: row.get("user_persona"),
            created_at: row.get("created_at"),
        })
    }

    fn message_from_row(row: &Row, session_id: &SessionId) -> Message {
        let id: i64 = row.get("id");
        Message {
            id,
            session_id: session_id.clone(),
            sender: row.get("sender"),
            content: row.get("content"),
            created_at: row.get("created_at"),
            // The serial id is monotone per append, so it doubles as the
            // within-session position.
            position: id,
        }
    }

    /// Verify a persona's profile reference is owned by the same owner.
    async fn check_profile_ref(
        &self,
        owner: &str,
        profile_id: Option<ProfileId>,
    ) -> Result<(), StoreError> {
        let Some(id) = profile_id else {
            return Ok(());
        };
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT owner FROM api_profiles WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        match row {
            Some(row) if row.get::<_, String>("owner") == owner => Ok(()),
            Some(_) => Err(StoreError::PermissionDenied {
                entity: "api_profile",
                id: id.to_string(),
            }),
            None => Err(StoreError::NotFound {
                entity: "api_profile",
                id: id.to_string(),
            }),
        }
    }
}

fn db_err(e: tokio_postgres::Error) -> StoreError {
    tracing::error!(error = %e, "database error");
    StoreError::Database {
        reason: e.to_string(),
    }
}

#[async_trait]
impl PersonaStore for PgStore {
    async fn create_api_profile(&self, req: NewApiProfile) -> Result<ApiProfile, StoreError> {
        let encrypted = self
            .cipher
            .encrypt(&req.api_key)
            .map_err(|e| StoreError::InsertFailed {
                entity: "api_profile",
                reason: e.to_string(),
            })?;
        let embedding_dim = req.embedding_dim.map(|d| d as i32);

        let preview = crate::key_preview(&req.api_key);

        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO api_profiles \
                 (owner, name, base_url, model, encrypted_api_key, api_key_preview, \
                  temperature, is_embedding_model, embedding_dim) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
                &[
                    &req.owner,
                    &req.name,
                    &req.base_url,
                    &req.model,
                    &encrypted,
                    &preview,
                    &req.temperature,
                    &req.is_embedding_model,
                    &embedding_dim,
                ],
            )
            .await
            .map_err(|e| StoreError::InsertFailed {
                entity: "api_profile",
                reason: e.to_string(),
            })?;
        Ok(Self::profile_from_row(&row))
    }

    async fn get_api_profile(&self, owner: &str, id: ProfileId) -> Result<ApiProfile, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM api_profiles WHERE id = $1 AND owner = $2",
                &[&id, &owner],
            )
            .await
            .map_err(db_err)?;
        row.map(|r| Self::profile_from_row(&r))
            .ok_or(StoreError::NotFound {
                entity: "api_profile",
                id: id.to_string(),
            })
    }

    async fn list_api_profiles(&self, owner: &str) -> Result<Vec<ApiProfile>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM api_profiles WHERE owner = $1 ORDER BY id",
                &[&owner],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(Self::profile_from_row).collect())
    }

    async fn update_api_profile(
        &self,
        owner: &str,
        id: ProfileId,
        patch: ApiProfilePatch,
    ) -> Result<ApiProfile, StoreError> {
        let current = self.get_api_profile(owner, id).await?;

        let (encrypted, preview) = match &patch.api_key {
            Some(key) => (
                self.cipher.encrypt(key).map_err(|e| StoreError::UpdateFailed {
                    entity: "api_profile",
                    id: id.to_string(),
                    reason: e.to_string(),
                })?,
                crate::key_preview(key),
            ),
            None => (current.encrypted_api_key.clone(), current.api_key_preview.clone()),
        };
        let name = patch.name.unwrap_or(current.name);
        let base_url = patch.base_url.unwrap_or(current.base_url);
        let model = patch.model.unwrap_or(current.model);
        let temperature = patch.temperature.or(current.temperature);
        let is_embedding_model = patch.is_embedding_model.unwrap_or(current.is_embedding_model);
        let embedding_dim = patch
            .embedding_dim
            .or(current.embedding_dim)
            .map(|d| d as i32);

        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "UPDATE api_profiles SET name = $3, base_url = $4, model = $5, \
                 encrypted_api_key = $6, api_key_preview = $7, temperature = $8, \
                 is_embedding_model = $9, embedding_dim = $10 \
                 WHERE id = $1 AND owner = $2 RETURNING *",
                &[
                    &id,
                    &owner,
                    &name,
                    &base_url,
                    &model,
                    &encrypted,
                    &preview,
                    &temperature,
                    &is_embedding_model,
                    &embedding_dim,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(Self::profile_from_row(&row))
    }

    async fn delete_api_profile(&self, owner: &str, id: ProfileId) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM api_profiles WHERE id = $1 AND owner = $2",
                &[&id, &owner],
            )
            .await
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "api_profile",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_persona(&self, req: NewPersona) -> Result<Persona, StoreError> {
        self.check_profile_ref(&req.owner, req.api_profile_id).await?;
        self.check_profile_ref(&req.owner, req.embedding_profile_id)
            .await?;

        let handle = req
            .handle
            .clone()
            .unwrap_or_else(|| slugify_handle(&req.display_name));

        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO personas \
                 (owner, handle, display_name, system_prompt, tone, proactivity, \
                  memory_window, max_agents_per_turn, api_profile_id, \
                  embedding_profile_id, is_default, background_text, rag_top_k) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 RETURNING *",
                &[
                    &req.owner,
                    &handle,
                    &req.display_name,
                    &req.system_prompt,
                    &req.tone,
                    &req.proactivity,
                    &(req.memory_window as i32),
                    &(req.max_agents_per_turn as i32),
                    &req.api_profile_id,
                    &req.embedding_profile_id,
                    &req.is_default,
                    &req.background_text,
                    &(req.rag_top_k as i32),
                ],
            )
            .await
            .map_err(|e| StoreError::InsertFailed {
                entity: "persona",
                reason: e.to_string(),
            })?;
        Ok(Self::persona_from_row(&row))
    }

    async fn get_persona(&self, owner: &str, id: PersonaId) -> Result<Persona, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM personas WHERE id = $1 AND owner = $2",
                &[&id, &owner],
            )
            .await
            .map_err(db_err)?;
        row.map(|r| Self::persona_from_row(&r))
            .ok_or(StoreError::NotFound {
                entity: "persona",
                id: id.to_string(),
            })
    }

    async fn get_persona_by_handle(
        &self,
        owner: &str,
        handle: &str,
    ) -> Result<Persona, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM personas WHERE owner = $1 AND handle = $2",
                &[&owner, &handle],
            )
            .await
            .map_err(db_err)?;
        row.map(|r| Self::persona_from_row(&r))
            .ok_or(StoreError::NotFound {
                entity: "persona",
                id: handle.to_string(),
            })
    }

    async fn list_personas(&self, owner: &str) -> Result<Vec<Persona>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM personas WHERE owner = $1 ORDER BY id",
                &[&owner],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(Self::persona_from_row).collect())
    }

    async fn update_persona(
        &self,
        owner: &str,
        id: PersonaId,
        patch: PersonaPatch,
    ) -> Result<Persona, StoreError> {
        if let Some(profile_ref) = patch.api_profile_id {
            self.check_profile_ref(owner, profile_ref).await?;
        }
        if let Some(profile_ref) = patch.embedding_profile_id {
            self.check_profile_ref(owner, profile_ref).await?;
        }

        let current = self.get_persona(owner, id).await?;
        let display_name = patch.display_name.unwrap_or(current.display_name);
        let handle = patch.handle.unwrap_or(current.handle);
        let system_prompt = patch.system_prompt.unwrap_or(current.system_prompt);
        let tone = patch.tone.unwrap_or(current.tone);
        let proactivity = patch.proactivity.unwrap_or(current.proactivity);
        let memory_window = patch.memory_window.unwrap_or(current.memory_window) as i32;
        let max_agents = patch
            .max_agents_per_turn
            .unwrap_or(current.max_agents_per_turn) as i32;
        let api_profile_id = patch.api_profile_id.unwrap_or(current.api_profile_id);
        let embedding_profile_id = patch
            .embedding_profile_id
            .unwrap_or(current.embedding_profile_id);
        let is_default = patch.is_default.unwrap_or(current.is_default);
        let background_text = patch.background_text.unwrap_or(current.background_text);
        let rag_top_k = patch.rag_top_k.unwrap_or(current.rag_top_k) as i32;

        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "UPDATE personas SET display_name = $3, handle = $4, system_prompt = $5, \
                 tone = $6, proactivity = $7, memory_window = $8, max_agents_per_turn = $9, \
                 api_profile_id = $10, embedding_profile_id = $11, is_default = $12, \
                 background_text = $13, rag_top_k = $14 \
                 WHERE id = $1 AND owner = $2 RETURNING *",
                &[
                    &id,
                    &owner,
                    &display_name,
                    &handle,
                    &system_prompt,
                    &tone,
                    &proactivity,
                    &memory_window,
                    &max_agents,
                    &api_profile_id,
                    &embedding_profile_id,
                    &is_default,
                    &background_text,
                    &rag_top_k,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(Self::persona_from_row(&row))
    }

    async fn delete_persona(&self, owner: &str, id: PersonaId) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM personas WHERE id = $1 AND owner = $2",
                &[&id, &owner],
            )
            .await
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "persona",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_personas_for_profile(
        &self,
        owner: &str,
        profile_id: ProfileId,
    ) -> Result<Vec<Persona>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM personas WHERE owner = $1 \
                 AND (api_profile_id = $2 OR embedding_profile_id = $2)",
                &[&owner, &profile_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(Self::persona_from_row).collect())
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
impl ConversationStore for PgStore {
    async fn create_session(&self, meta: NewSession) -> Result<Session, StoreError> {
        let id = SessionId::generate(&meta.owner).map_err(|e| StoreError::InsertFailed {
            entity: "session",
            reason: e.to_string(),
        })?;
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO sessions (id, owner, title, user_display_name, user_handle, user_persona) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
                &[
                    &id.as_str(),
                    &meta.owner,
                    &meta.title,
                    &meta.user_display_name,
                    &meta.user_handle,
                    &meta.user_persona,
                ],
            )
            .await
            .map_err(|e| StoreError::InsertFailed {
                entity: "session",
                reason: e.to_string(),
            })?;
        Self::session_from_row(&row)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM sessions WHERE id = $1", &[&id.as_str()])
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => Self::session_from_row(&row),
            None => Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            }),
        }
    }

    async fn list_sessions(&self, owner: &str) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM sessions WHERE owner = $1 ORDER BY created_at",
                &[&owner],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::session_from_row).collect()
    }

    async fn update_session_meta(
        &self,
        id: &SessionId,
        patch: SessionMetaPatch,
    ) -> Result<Session, StoreError> {
        let current = self.get_session(id).await?;
        let title = patch.title.or(current.title);
        let user_display_name = patch.user_display_name.or(current.user_display_name);
        let user_handle = patch.user_handle.or(current.user_handle);
        let user_persona = patch.user_persona.or(current.user_persona);

        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "UPDATE sessions SET title = $2, user_display_name = $3, \
                 user_handle = $4, user_persona = $5 WHERE id = $1 RETURNING *",
                &[
                    &id.as_str(),
                    &title,
                    &user_display_name,
                    &user_handle,
                    &user_persona,
                ],
            )
            .await
            .map_err(db_err)?;
        Self::session_from_row(&row)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM sessions WHERE id = $1", &[&id.as_str()])
            .await
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_sessions(&self, ids: &[SessionId], owner: &str) -> Result<usize, StoreError> {
        let raw: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM sessions WHERE owner = $1 AND id = ANY($2)",
                &[&owner, &raw],
            )
            .await
            .map_err(db_err)?;
        Ok(deleted as usize)
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        sender: &str,
        content: &str,
    ) -> Result<Message, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO messages (session_id, sender, content) \
                 VALUES ($1, $2, $3) RETURNING *",
                &[&session_id.as_str(), &sender, &content],
            )
            .await
            .map_err(|e| {
                // A missing session surfaces as an FK violation.
                StoreError::NotFound {
                    entity: "session",
                    id: format!("{} ({})", session_id, e),
                }
            })?;
        Ok(Self::message_from_row(&row, session_id))
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        // Existence check so callers can distinguish "empty" from "gone".
        self.get_session(session_id).await?;

        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM ( \
                   SELECT * FROM messages WHERE session_id = $1 \
                   ORDER BY created_at DESC, id DESC LIMIT $2 \
                 ) recent ORDER BY created_at ASC, id ASC",
                &[&session_id.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| Self::message_from_row(row, session_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert!(config.database_url.starts_with("postgres://"));
        assert_eq!(config.max_size, 16);
    }

    #[test]
    fn test_db_config_rejects_bad_url() {
        let config = DbConfig {
            database_url: "not a url".to_string(),
            max_size: 4,
        };
        assert!(config.create_pool().is_err());
    }

    #[test]
    fn test_schema_sql_embeds_all_tables() {
        for table in ["api_profiles", "personas", "sessions", "messages"] {
            assert!(SCHEMA_SQL.contains(table), "schema missing {}", table);
        }
    }
}
