//! Shared application state for Axum routers.

use crate::config::AppConfig;
use parley_retrieval::RetrievalEngine;
use parley_runtime::SessionOrchestrator;
use parley_store::{ConversationStore, PersonaStore};
use std::sync::Arc;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub personas: Arc<dyn PersonaStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub retrieval: Arc<RetrievalEngine>,
    pub config: Arc<AppConfig>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        personas: Arc<dyn PersonaStore>,
        conversations: Arc<dyn ConversationStore>,
        orchestrator: Arc<SessionOrchestrator>,
        retrieval: Arc<RetrievalEngine>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            personas,
            conversations,
            orchestrator,
            retrieval,
            config,
            start_time: std::time::Instant::now(),
        }
    }
}
