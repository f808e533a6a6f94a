//! Error types for PARLEY operations

use thiserror::Error;

/// Persistence layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Permission denied for {entity} {id}")]
    PermissionDenied { entity: &'static str, id: String },

    #[error("Insert failed for {entity}: {reason}")]
    InsertFailed { entity: &'static str, reason: String },

    #[error("Update failed for {entity} {id}: {reason}")]
    UpdateFailed {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("Database error: {reason}")]
    Database { reason: String },
}

/// LLM provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("Request to {base_url} failed with status {status}: {message}")]
    RequestFailed {
        base_url: String,
        status: u16,
        message: String,
    },

    #[error("Transport error calling {base_url}: {reason}")]
    Transport { base_url: String, reason: String },

    #[error("Invalid response from provider: {reason}")]
    InvalidResponse { reason: String },

    #[error("LLM call exceeded {timeout_secs}s deadline")]
    Timeout { timeout_secs: u64 },

    #[error("Embedding failed: {reason}")]
    EmbeddingFailed { reason: String },

    #[error("Stream cancelled")]
    Cancelled,
}

/// Retrieval engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("Vector store error: {reason}")]
    VectorStore { reason: String },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Persona has no embedding profile configured")]
    NoEmbeddingProfile,

    #[error("Embedding dimension mismatch: collection has {expected}, embedder produced {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Validation errors on externally supplied values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("API key decryption failed")]
    KeyDecryptionFailed,
}

/// Master error type for all PARLEY errors.
#[derive(Debug, Clone, Error)]
pub enum ParleyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session task cancelled")]
    Cancelled,
}

/// Result type alias for PARLEY operations.
pub type ParleyResult<T> = Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = StoreError::NotFound {
            entity: "persona",
            id: "42".to_string(),
        };
        assert_eq!(err.to_string(), "persona not found: 42");

        let err: ParleyError = LlmError::Timeout { timeout_secs: 60 }.into();
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn test_master_error_from_layers() {
        let store: ParleyError = StoreError::Database {
            reason: "pool closed".to_string(),
        }
        .into();
        assert!(matches!(store, ParleyError::Store(_)));

        let config: ParleyError = ConfigError::KeyDecryptionFailed.into();
        assert!(matches!(config, ParleyError::Config(_)));
    }
}
