//! Per-invocation tool binding
//!
//! Tools are bound to a [`ToolContext`] at invocation time rather than
//! registered globally. The context carries the owner and persona the
//! call is executing for; the model-visible arguments never contain
//! tenant identifiers, so a model cannot steer retrieval into another
//! tenant's collection.

use async_trait::async_trait;
use parley_core::{EmbeddingConfig, ParleyError, PersonaId};
use parley_llm::ToolSpec;
use parley_retrieval::RetrievalEngine;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on passages a tool call may request.
const MAX_TOP_K: usize = 10;

/// Trusted per-call context, derived from the session, never from the
/// model.
#[derive(Clone)]
pub struct ToolContext {
    pub owner: String,
    pub persona_id: PersonaId,
    /// Resolved collection for `(owner, persona_id)`.
    pub collection: String,
    pub embed: EmbeddingConfig,
    /// Persona-configured default passage count.
    pub default_top_k: usize,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("owner", &self.owner)
            .field("persona_id", &self.persona_id)
            .field("collection", &self.collection)
            .finish()
    }
}

/// A tool the persona runtime can advertise to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Execute with model-provided `arguments` (raw JSON) under the
    /// trusted context. Returns the tool result text fed back to the
    /// model.
    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<String, ParleyError>;
}

// ============================================================================
// KNOWLEDGE SEARCH TOOL
// ============================================================================

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

/// The single tool advertised in retrieval mode: search this persona's
/// private knowledge base.
pub struct SearchKnowledgeTool {
    engine: Arc<RetrievalEngine>,
}

impl SearchKnowledgeTool {
    pub fn new(engine: Arc<RetrievalEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_knowledge".to_string(),
            description: "Search your private background knowledge for passages relevant \
                          to a natural-language query."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to look up"
                    },
                    "k": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_TOP_K,
                        "description": "How many passages to return"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<String, ParleyError> {
        let args: SearchArgs =
            serde_json::from_str(arguments).map_err(|e| parley_core::ValidationError::InvalidValue {
                field: "arguments".to_string(),
                reason: e.to_string(),
            })?;

        let top_k = args.k.unwrap_or(ctx.default_top_k).clamp(1, MAX_TOP_K);
        debug!(
            collection = %ctx.collection,
            top_k,
            "search_knowledge invoked"
        );

        let hits = self
            .engine
            .search(&ctx.collection, &ctx.embed, &args.query, top_k)
            .await?;

        if hits.is_empty() {
            return Ok("No relevant passages found.".to_string());
        }

        Ok(hits
            .iter()
            .map(|hit| format!("[{}] {}", hit.source, hit.text))
            .collect::<Vec<_>>()
            .join("\n---\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_llm::MockEmbeddingProvider;
    use parley_retrieval::InMemoryVectorStore;

    fn ctx(engine: &Arc<RetrievalEngine>) -> (Arc<RetrievalEngine>, ToolContext) {
        (
            engine.clone(),
            ToolContext {
                owner: "alice".to_string(),
                persona_id: 1,
                collection: "alice_persona_1_rag".to_string(),
                embed: EmbeddingConfig {
                    base_url: "http://localhost:9/v1".to_string(),
                    model: "test-embed".to_string(),
                    api_key: "sk-test".to_string(),
                    dimension: 64,
                },
                default_top_k: 3,
            },
        )
    }

    fn engine() -> Arc<RetrievalEngine> {
        Arc::new(RetrievalEngine::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockEmbeddingProvider),
        ))
    }

    #[tokio::test]
    async fn test_search_tool_formats_passages() {
        let engine = engine();
        let (engine, ctx) = ctx(&engine);
        engine
            .ingest_text(&ctx.collection, &ctx.embed, "The secret code is 42.", "background")
            .await
            .unwrap();

        let tool = SearchKnowledgeTool::new(engine);
        let out = tool
            .invoke(&ctx, r#"{"query": "secret code"}"#)
            .await
            .unwrap();
        assert!(out.contains("[background]"));
        assert!(out.contains("42"));
    }

    #[tokio::test]
    async fn test_search_tool_empty_collection() {
        let engine = engine();
        let (engine, ctx) = ctx(&engine);
        let tool = SearchKnowledgeTool::new(engine);
        let out = tool.invoke(&ctx, r#"{"query": "anything"}"#).await.unwrap();
        assert_eq!(out, "No relevant passages found.");
    }

    #[tokio::test]
    async fn test_search_tool_rejects_malformed_arguments() {
        let engine = engine();
        let (engine, ctx) = ctx(&engine);
        let tool = SearchKnowledgeTool::new(engine);
        assert!(tool.invoke(&ctx, "not json").await.is_err());
        assert!(tool.invoke(&ctx, r#"{"k": 3}"#).await.is_err());
    }

    #[test]
    fn test_spec_has_no_tenant_parameters() {
        let tool = SearchKnowledgeTool::new(engine());
        let spec = tool.spec();
        let params = spec.parameters.to_string();
        assert!(!params.contains("owner"));
        assert!(!params.contains("persona"));
        assert!(!params.contains("collection"));
    }
}
