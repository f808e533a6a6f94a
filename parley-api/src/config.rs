//! Service Configuration
//!
//! All knobs load from environment variables with development defaults;
//! the encryption key is the only required value.

use parley_core::ConfigError;
use parley_runtime::OrchestratorConfig;
use std::time::Duration;

const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_IDLE_EVICTION_SECS: u64 = 1800;
const DEFAULT_MAX_HISTORY: usize = 128;
const DEFAULT_EVENT_BUFFER: usize = 64;
const DEFAULT_VECTOR_STORE_URL: &str = "http://localhost:6334";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Qdrant endpoint for the retrieval engine.
    pub vector_store_url: String,
    /// Symmetric key for API-key at-rest encryption. Required.
    pub encryption_key: String,
    /// Per-LLM-call wall-clock timeout.
    pub llm_call_timeout: Duration,
    /// Idle timeout for session runtime bindings.
    pub session_idle_eviction: Duration,
    /// Cap on history entries loaded per turn (hard cap 128).
    pub max_history_per_request: usize,
    /// Event-bus buffer per subscriber.
    pub event_bus_per_subscriber_buffer: usize,
    /// Fixed scheduler seed for reproducible runs; random when unset.
    pub scheduler_seed: Option<u64>,
    /// Allowed CORS origins; empty means allow all (development).
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// Environment variables:
    /// - `PARLEY_VECTOR_STORE_URL`: Qdrant endpoint (default: http://localhost:6334)
    /// - `PARLEY_ENCRYPTION_KEY`: API-key encryption secret (required)
    /// - `PARLEY_LLM_TIMEOUT_SECS`: per-call timeout (default: 60)
    /// - `PARLEY_IDLE_EVICTION_SECS`: binding idle timeout (default: 1800)
    /// - `PARLEY_MAX_HISTORY`: history cap per turn (default: 128, hard cap 128)
    /// - `PARLEY_EVENT_BUFFER`: per-subscriber event buffer (default: 64)
    /// - `PARLEY_SCHEDULER_SEED`: fixed scheduler seed (default: random)
    /// - `PARLEY_CORS_ORIGINS`: comma-separated origins (default: allow all)
    pub fn from_env() -> Result<Self, ConfigError> {
        let encryption_key =
            std::env::var("PARLEY_ENCRYPTION_KEY").map_err(|_| ConfigError::MissingRequired {
                field: "PARLEY_ENCRYPTION_KEY".to_string(),
            })?;

        let cors_origins = std::env::var("PARLEY_CORS_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            vector_store_url: std::env::var("PARLEY_VECTOR_STORE_URL")
                .unwrap_or_else(|_| DEFAULT_VECTOR_STORE_URL.to_string()),
            encryption_key,
            llm_call_timeout: Duration::from_secs(
                env_parse("PARLEY_LLM_TIMEOUT_SECS").unwrap_or(DEFAULT_LLM_TIMEOUT_SECS),
            ),
            session_idle_eviction: Duration::from_secs(
                env_parse("PARLEY_IDLE_EVICTION_SECS").unwrap_or(DEFAULT_IDLE_EVICTION_SECS),
            ),
            max_history_per_request: env_parse("PARLEY_MAX_HISTORY")
                .unwrap_or(DEFAULT_MAX_HISTORY),
            event_bus_per_subscriber_buffer: env_parse("PARLEY_EVENT_BUFFER")
                .unwrap_or(DEFAULT_EVENT_BUFFER),
            scheduler_seed: env_parse("PARLEY_SCHEDULER_SEED"),
            cors_origins,
        })
    }

    /// Orchestrator view of this configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            llm_timeout: self.llm_call_timeout,
            idle_eviction: self.session_idle_eviction,
            max_history: self.max_history_per_request,
            event_buffer: self.event_bus_per_subscriber_buffer,
            scheduler_seed: self.scheduler_seed,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig {
            vector_store_url: DEFAULT_VECTOR_STORE_URL.to_string(),
            encryption_key: "test".to_string(),
            llm_call_timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
            session_idle_eviction: Duration::from_secs(DEFAULT_IDLE_EVICTION_SECS),
            max_history_per_request: DEFAULT_MAX_HISTORY,
            event_bus_per_subscriber_buffer: DEFAULT_EVENT_BUFFER,
            scheduler_seed: None,
            cors_origins: Vec::new(),
        }
    }

    #[test]
    fn test_orchestrator_config_projection() {
        let config = test_config().orchestrator_config();
        assert_eq!(config.llm_timeout, Duration::from_secs(60));
        assert_eq!(config.idle_eviction, Duration::from_secs(1800));
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.max_history, 128);
    }
}
