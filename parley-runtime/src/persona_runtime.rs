//! Persona runtime
//!
//! Drives one streaming LLM reply for one persona. In retrieval mode
//! the model is offered the `search_knowledge` tool, resolved against
//! the persona's own collection through the trusted [`ToolContext`]; in
//! direct mode, top passages for the current query are inlined into the
//! system prompt instead. Errors terminate the stream without
//! persisting anything; the orchestrator decides what to commit.

use crate::prompt::build_messages;
use crate::tools::{SearchKnowledgeTool, Tool, ToolContext};
use parley_core::{LlmConfig, LlmError, Message, ParleyError, Persona};
use parley_llm::{ChatMessage, ChatProvider, ChatStreamEvent, FinishReason, ToolCallRequest};
use parley_retrieval::{RetrievalEngine, ScoredChunk};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on tool round-trips within one reply. The final round is
/// offered no tools, forcing a textual answer.
const MAX_TOOL_ROUNDS: usize = 4;

/// How many trailing history entries join the user message when forming
/// the inline-retrieval query.
const QUERY_CONTEXT_MESSAGES: usize = 3;

/// How a persona consults its knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Passages for the current query are inlined into the prompt.
    Direct,
    /// The model decides when to search, via the advertised tool.
    Retrieval,
}

/// Events on a reply stream, in order: zero or more `Chunk`s, then
/// exactly one `Done` or `Failed` — unless the reply was cancelled, in
/// which case the stream just closes.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Chunk(String),
    Done { full_text: String },
    Failed { error: LlmError },
}

/// Everything one reply needs. The decrypted [`LlmConfig`] lives only
/// for the duration of the call.
pub struct ReplyRequest {
    pub persona: Persona,
    pub llm: LlmConfig,
    pub history: Vec<Message>,
    pub user_sender: String,
    pub user_message: String,
    pub mode: ReplyMode,
    pub tool_ctx: Option<ToolContext>,
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

/// Streams persona replies. Shared across sessions; per-call state
/// arrives in the [`ReplyRequest`].
pub struct PersonaRuntime {
    chat: Arc<dyn ChatProvider>,
    retrieval: Arc<RetrievalEngine>,
}

impl PersonaRuntime {
    pub fn new(chat: Arc<dyn ChatProvider>, retrieval: Arc<RetrievalEngine>) -> Self {
        Self { chat, retrieval }
    }

    /// Start one reply. The returned channel yields chunks as the model
    /// produces them and closes after the terminal event (or silently
    /// on cancellation).
    pub fn stream_reply(&self, req: ReplyRequest) -> mpsc::Receiver<ReplyEvent> {
        let (tx, rx) = mpsc::channel(64);
        let chat = self.chat.clone();
        let retrieval = self.retrieval.clone();

        tokio::spawn(async move {
            let timeout_secs = req.timeout.as_secs();
            let outcome = tokio::time::timeout(req.timeout, drive(chat, retrieval, req, tx.clone())).await;
            if outcome.is_err() {
                let _ = tx
                    .send(ReplyEvent::Failed {
                        error: LlmError::Timeout { timeout_secs },
                    })
                    .await;
            }
        });

        rx
    }
}

impl std::fmt::Debug for PersonaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersonaRuntime").finish()
    }
}

/// Inline-retrieval query: the triggering message plus a little recent
/// context.
fn inline_query(history: &[Message], user_message: &str) -> String {
    let mut parts = vec![user_message.to_string()];
    let start = history.len().saturating_sub(QUERY_CONTEXT_MESSAGES);
    for entry in &history[start..] {
        parts.push(entry.content.clone());
    }
    parts.join(" ")
}

async fn drive(
    chat: Arc<dyn ChatProvider>,
    retrieval: Arc<RetrievalEngine>,
    req: ReplyRequest,
    tx: mpsc::Sender<ReplyEvent>,
) {
    // Direct mode: fetch passages up front.
    let mut passages: Vec<ScoredChunk> = Vec::new();
    if req.mode == ReplyMode::Direct {
        if let Some(ctx) = &req.tool_ctx {
            let query = inline_query(&req.history, &req.user_message);
            match retrieval
                .search(&ctx.collection, &ctx.embed, &query, req.persona.rag_top_k)
                .await
            {
                Ok(hits) => passages = hits,
                Err(e) => {
                    let _ = tx
                        .send(ReplyEvent::Failed {
                            error: LlmError::EmbeddingFailed {
                                reason: e.to_string(),
                            },
                        })
                        .await;
                    return;
                }
            }
        }
    }

    // Retrieval mode: bind the search tool to this invocation's context.
    let tool: Option<(SearchKnowledgeTool, &ToolContext)> = match (&req.mode, &req.tool_ctx) {
        (ReplyMode::Retrieval, Some(ctx)) => Some((SearchKnowledgeTool::new(retrieval), ctx)),
        _ => None,
    };
    let specs = tool
        .as_ref()
        .map(|(t, _)| vec![t.spec()])
        .unwrap_or_default();

    let mut messages = build_messages(
        &req.persona,
        &passages,
        &req.history,
        &req.user_sender,
        &req.user_message,
    );

    let mut full_text = String::new();

    for round in 0..MAX_TOOL_ROUNDS {
        // Starve the model of tools in the last round so it must answer.
        let advertised: &[parley_llm::ToolSpec] = if round + 1 == MAX_TOOL_ROUNDS {
            &[]
        } else {
            &specs
        };

        let mut stream = match chat
            .stream_chat(&req.llm, &messages, advertised, req.cancel.child_token())
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                let _ = tx.send(ReplyEvent::Failed { error }).await;
                return;
            }
        };

        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let mut finish: Option<FinishReason> = None;

        while let Some(item) = stream.recv().await {
            match item {
                Ok(ChatStreamEvent::Delta(content)) => {
                    full_text.push_str(&content);
                    if tx.send(ReplyEvent::Chunk(content)).await.is_err() {
                        return;
                    }
                }
                Ok(ChatStreamEvent::ToolCall(call)) => tool_calls.push(call),
                Ok(ChatStreamEvent::Done { finish_reason }) => {
                    finish = Some(finish_reason);
                    break;
                }
                Err(error) => {
                    if !req.cancel.is_cancelled() {
                        let _ = tx.send(ReplyEvent::Failed { error }).await;
                    }
                    return;
                }
            }
        }

        let Some(finish) = finish else {
            // Stream closed with no terminal event: cancelled, or the
            // provider died mid-flight.
            if !req.cancel.is_cancelled() {
                let _ = tx
                    .send(ReplyEvent::Failed {
                        error: LlmError::InvalidResponse {
                            reason: "stream ended without completion".to_string(),
                        },
                    })
                    .await;
            }
            return;
        };

        let wants_tools = finish == FinishReason::ToolCalls && !tool_calls.is_empty();
        if !wants_tools {
            let _ = tx.send(ReplyEvent::Done { full_text }).await;
            return;
        }

        let Some((tool_impl, ctx)) = tool.as_ref() else {
            warn!("model requested tools but none were advertised");
            let _ = tx.send(ReplyEvent::Done { full_text }).await;
            return;
        };

        messages.push(ChatMessage::assistant_tool_calls(tool_calls.clone()));
        for call in tool_calls {
            debug!(tool = %call.name, "resolving tool call");
            let result = match tool_impl.invoke(ctx, &call.arguments).await {
                Ok(text) => text,
                Err(ParleyError::Validation(e)) => {
                    // Malformed model arguments go back to the model.
                    format!("Invalid tool arguments: {}", e)
                }
                Err(e) => {
                    let _ = tx
                        .send(ReplyEvent::Failed {
                            error: LlmError::InvalidResponse {
                                reason: format!("tool '{}' failed: {}", call.name, e),
                            },
                        })
                        .await;
                    return;
                }
            };
            messages.push(ChatMessage::tool_result(call.id, result));
        }
    }

    // All rounds spent; whatever text accumulated is the reply.
    let _ = tx.send(ReplyEvent::Done { full_text }).await;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::EmbeddingConfig;
    use parley_llm::{MockChatProvider, MockEmbeddingProvider, MockTurn};
    use parley_retrieval::InMemoryVectorStore;

    fn persona() -> Persona {
        Persona {
            id: 1,
            owner: "alice".to_string(),
            handle: "maid".to_string(),
            display_name: "Maid".to_string(),
            system_prompt: "A housekeeper.".to_string(),
            tone: "formal".to_string(),
            proactivity: 0.5,
            memory_window: 8,
            max_agents_per_turn: 2,
            api_profile_id: None,
            embedding_profile_id: None,
            is_default: false,
            background_text: None,
            rag_top_k: 3,
            created_at: Utc::now(),
        }
    }

    fn llm_config() -> LlmConfig {
        LlmConfig {
            base_url: "http://localhost:9/v1".to_string(),
            model: "test".to_string(),
            api_key: "sk-test".to_string(),
            temperature: None,
        }
    }

    fn embed_config() -> EmbeddingConfig {
        EmbeddingConfig {
            base_url: "http://localhost:9/v1".to_string(),
            model: "test-embed".to_string(),
            api_key: "sk-test".to_string(),
            dimension: 64,
        }
    }

    fn retrieval() -> Arc<RetrievalEngine> {
        Arc::new(RetrievalEngine::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockEmbeddingProvider),
        ))
    }

    fn request(mode: ReplyMode, tool_ctx: Option<ToolContext>) -> ReplyRequest {
        ReplyRequest {
            persona: persona(),
            llm: llm_config(),
            history: Vec::new(),
            user_sender: "user".to_string(),
            user_message: "what is the secret code?".to_string(),
            mode,
            tool_ctx,
            cancel: CancellationToken::new(),
            timeout: Duration::from_secs(5),
        }
    }

    fn tool_ctx() -> ToolContext {
        ToolContext {
            owner: "alice".to_string(),
            persona_id: 1,
            collection: "alice_persona_1_rag".to_string(),
            embed: embed_config(),
            default_top_k: 3,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ReplyEvent>) -> Vec<ReplyEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_plain_reply_chunks_then_done() {
        let chat = Arc::new(MockChatProvider::new(vec![MockTurn::text(&[
            "Certainly, ",
            "madam.",
        ])]));
        let runtime = PersonaRuntime::new(chat, retrieval());
        let events = collect(runtime.stream_reply(request(ReplyMode::Direct, None))).await;

        assert_eq!(
            events,
            vec![
                ReplyEvent::Chunk("Certainly, ".to_string()),
                ReplyEvent::Chunk("madam.".to_string()),
                ReplyEvent::Done {
                    full_text: "Certainly, madam.".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_chunk_join_equals_done_text() {
        let chat = Arc::new(MockChatProvider::new(vec![MockTurn::text(&[
            "a", "b", "c", "d",
        ])]));
        let runtime = PersonaRuntime::new(chat, retrieval());
        let events = collect(runtime.stream_reply(request(ReplyMode::Direct, None))).await;

        let joined: String = events
            .iter()
            .filter_map(|e| match e {
                ReplyEvent::Chunk(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        match events.last().unwrap() {
            ReplyEvent::Done { full_text } => assert_eq!(&joined, full_text),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let retrieval = retrieval();
        let ctx = tool_ctx();
        retrieval
            .ingest_text(&ctx.collection, &ctx.embed, "The secret code is 42.", "background")
            .await
            .unwrap();

        let chat = Arc::new(MockChatProvider::new(vec![
            MockTurn::tool_call("call_1", "search_knowledge", r#"{"query": "secret code"}"#),
            MockTurn::text(&["The code is 42."]),
        ]));
        let runtime = PersonaRuntime::new(chat.clone(), retrieval);
        let events =
            collect(runtime.stream_reply(request(ReplyMode::Retrieval, Some(ctx)))).await;

        match events.last().unwrap() {
            ReplyEvent::Done { full_text } => assert!(full_text.contains("42")),
            other => panic!("expected Done, got {:?}", other),
        }

        // Second call must carry the tool result back to the model.
        let calls = chat.recorded_calls();
        assert_eq!(calls.len(), 2);
        let tool_message = calls[1]
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_1"))
            .expect("tool result message present");
        assert!(tool_message.content.contains("42"));
    }

    #[tokio::test]
    async fn test_direct_mode_inlines_passages() {
        let retrieval = retrieval();
        let ctx = tool_ctx();
        retrieval
            .ingest_text(&ctx.collection, &ctx.embed, "The secret code is 42.", "background")
            .await
            .unwrap();

        let chat = Arc::new(MockChatProvider::new(vec![MockTurn::text(&["It is 42."])]));
        let runtime = PersonaRuntime::new(chat.clone(), retrieval);
        let events = collect(runtime.stream_reply(request(ReplyMode::Direct, Some(ctx)))).await;
        assert!(matches!(events.last().unwrap(), ReplyEvent::Done { .. }));

        let calls = chat.recorded_calls();
        assert!(calls[0][0].content.contains("The secret code is 42."));
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces_as_failed() {
        let chat = Arc::new(parley_llm::FailingChatProvider);
        let runtime = PersonaRuntime::new(chat, retrieval());
        let events = collect(runtime.stream_reply(request(ReplyMode::Direct, None))).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReplyEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_failed() {
        let chat = Arc::new(MockChatProvider::new(vec![MockTurn::text_with_delay(
            &["a", "b", "c", "d", "e", "f"],
            Duration::from_millis(100),
        )]));
        let runtime = PersonaRuntime::new(chat, retrieval());
        let mut req = request(ReplyMode::Direct, None);
        req.timeout = Duration::from_millis(150);
        let events = collect(runtime.stream_reply(req)).await;

        match events.last().unwrap() {
            ReplyEvent::Failed {
                error: LlmError::Timeout { .. },
            } => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_closes_stream_without_terminal() {
        let chat = Arc::new(MockChatProvider::new(vec![MockTurn::text_with_delay(
            &["a", "b", "c", "d", "e", "f"],
            Duration::from_millis(50),
        )]));
        let runtime = PersonaRuntime::new(chat, retrieval());
        let mut req = request(ReplyMode::Direct, None);
        let cancel = CancellationToken::new();
        req.cancel = cancel.clone();

        let mut rx = runtime.stream_reply(req);
        let first = rx.recv().await.unwrap();
        assert_eq!(first, ReplyEvent::Chunk("a".to_string()));
        cancel.cancel();

        let mut rest = Vec::new();
        while let Some(event) = rx.recv().await {
            rest.push(event);
        }
        assert!(
            !rest
                .iter()
                .any(|e| matches!(e, ReplyEvent::Done { .. } | ReplyEvent::Failed { .. })),
            "cancelled stream must not emit a terminal event: {:?}",
            rest
        );
    }

    #[test]
    fn test_inline_query_includes_recent_context() {
        let session_id = parley_core::SessionId::generate("alice").unwrap();
        let history: Vec<Message> = (0..5)
            .map(|i| Message {
                id: i,
                session_id: session_id.clone(),
                sender: "user".to_string(),
                content: format!("h{}", i),
                created_at: Utc::now(),
                position: i,
            })
            .collect();
        let query = inline_query(&history, "the question");
        assert!(query.starts_with("the question"));
        assert!(query.contains("h4"));
        assert!(!query.contains("h0"));
    }
}
