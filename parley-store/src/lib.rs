//! PARLEY Store - Persona and Conversation Persistence
//!
//! Two store traits back the orchestrator: [`PersonaStore`] (API
//! profiles, personas, decrypted LLM configs) and [`ConversationStore`]
//! (sessions and their append-only message logs). The production
//! implementation speaks PostgreSQL through a deadpool connection pool;
//! an in-memory implementation backs tests and single-node development.

mod crypto;
mod memory;
mod pg;
mod traits;

pub use crypto::{key_preview, KeyCipher};
pub use memory::InMemoryStore;
pub use pg::{DbConfig, PgStore};
pub use traits::{
    ApiProfilePatch, ConversationStore, NewApiProfile, NewPersona, NewSession, PersonaPatch,
    PersonaStore, SessionMetaPatch,
};
