//! PARLEY LLM - Provider Abstraction Layer
//!
//! Provider-agnostic traits for streaming chat completion and text
//! embedding against OpenAI-compatible endpoints. Connection parameters
//! (including the decrypted API key) are passed per call so that secrets
//! never outlive the dispatching call frame.

pub mod openai;

use async_trait::async_trait;
use parley_core::{EmbeddingConfig, LlmConfig, LlmError};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use openai::{OpenAiChatProvider, OpenAiEmbeddingProvider};

// ============================================================================
// CHAT TYPES
// ============================================================================

/// Message role on the chat-completions wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One prompt message sent to the provider.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Present on `Role::Tool` messages: the id of the call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Present on assistant messages that requested tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }
}

/// A tool advertised to the model: name, description, and a JSON schema
/// for its input object.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A complete tool invocation requested by the model.
///
/// Serializes in the OpenAI wire shape
/// `{"id", "type": "function", "function": {"name", "arguments"}}` so
/// assistant messages can be echoed back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded argument object, exactly as the model produced it.
    pub arguments: String,
}

impl serde::Serialize for ToolCallRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        #[derive(serde::Serialize)]
        struct Function<'a> {
            name: &'a str,
            arguments: &'a str,
        }
        let mut state = serializer.serialize_struct("ToolCallRequest", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("type", "function")?;
        state.serialize_field(
            "function",
            &Function {
                name: &self.name,
                arguments: &self.arguments,
            },
        )?;
        state.end()
    }
}

impl<'de> serde::Deserialize<'de> for ToolCallRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Function {
            name: String,
            arguments: String,
        }
        #[derive(serde::Deserialize)]
        struct Wire {
            id: String,
            function: Function,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(ToolCallRequest {
            id: wire.id,
            name: wire.function.name,
            arguments: wire.function.arguments,
        })
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Other(String),
}

/// Events produced by a streaming chat call, in generation order.
///
/// Tool calls are accumulated from their wire deltas and emitted whole,
/// immediately before the terminal `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    /// A fragment of assistant text.
    Delta(String),
    /// A fully assembled tool invocation request.
    ToolCall(ToolCallRequest),
    /// Terminal event; no further events follow.
    Done { finish_reason: FinishReason },
}

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

/// Streaming chat completion provider. Implementations must be
/// thread-safe; connection parameters arrive per call.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a streaming completion. The returned channel yields events
    /// in generation order and closes after `Done` or an error item.
    /// Cancelling `cancel` stops the stream promptly.
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<ChatStreamEvent, LlmError>>, LlmError>;
}

/// Text embedding provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts` in order. Every returned vector has
    /// `config.dimension` components.
    async fn embed(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, LlmError>;
}

// ============================================================================
// MOCK PROVIDERS FOR TESTING
// ============================================================================

/// One scripted provider turn for [`MockChatProvider`].
#[derive(Debug, Clone)]
pub struct MockTurn {
    pub events: Vec<ChatStreamEvent>,
    /// Pause before each event, to exercise streaming interleavings.
    pub chunk_delay: Duration,
}

impl MockTurn {
    /// A plain text reply split into the given chunks.
    pub fn text(chunks: &[&str]) -> Self {
        let mut events: Vec<ChatStreamEvent> = chunks
            .iter()
            .map(|c| ChatStreamEvent::Delta(c.to_string()))
            .collect();
        events.push(ChatStreamEvent::Done {
            finish_reason: FinishReason::Stop,
        });
        Self {
            events,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Same as [`MockTurn::text`] with an inter-chunk delay.
    pub fn text_with_delay(chunks: &[&str], chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            ..Self::text(chunks)
        }
    }

    /// A turn that requests a single tool call and stops.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            events: vec![
                ChatStreamEvent::ToolCall(ToolCallRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                }),
                ChatStreamEvent::Done {
                    finish_reason: FinishReason::ToolCalls,
                },
            ],
            chunk_delay: Duration::ZERO,
        }
    }
}

/// Scripted chat provider: each `stream_chat` call replays the next
/// scripted turn. Records the messages of every call for assertions.
pub struct MockChatProvider {
    script: Mutex<VecDeque<MockTurn>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    /// When the script runs dry, either fail or fall back to this reply.
    fallback: Option<MockTurn>,
}

impl MockChatProvider {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    /// A provider that answers every call with the same chunk sequence.
    pub fn repeating(turn: MockTurn) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            fallback: Some(turn),
        }
    }

    /// Messages from every `stream_chat` call so far, in call order.
    pub fn recorded_calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().expect("mock poisoned").clone()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn stream_chat(
        &self,
        _config: &LlmConfig,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<ChatStreamEvent, LlmError>>, LlmError> {
        self.calls
            .lock()
            .expect("mock poisoned")
            .push(messages.to_vec());

        let turn = {
            let mut script = self.script.lock().expect("mock poisoned");
            script.pop_front().or_else(|| self.fallback.clone())
        }
        .ok_or_else(|| LlmError::InvalidResponse {
            reason: "mock script exhausted".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in turn.events {
                if !turn.chunk_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(turn.chunk_delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                } else if cancel.is_cancelled() {
                    return;
                }
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Chat provider that fails every call, for error-path tests.
pub struct FailingChatProvider;

#[async_trait]
impl ChatProvider for FailingChatProvider {
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<ChatStreamEvent, LlmError>>, LlmError> {
        Err(LlmError::RequestFailed {
            base_url: config.base_url.clone(),
            status: 500,
            message: "mock upstream failure".to_string(),
        })
    }
}

/// Deterministic embedding provider for tests: character-frequency
/// vectors, L2-normalized, at the configured dimension.
pub struct MockEmbeddingProvider;

impl MockEmbeddingProvider {
    fn embed_one(text: &str, dimension: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dimension.max(1)];
        for (i, b) in text.to_lowercase().bytes().enumerate() {
            let idx = (i.wrapping_mul(31) ^ (b as usize)) % v.len();
            v[idx] += (b as f32) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts
            .iter()
            .map(|t| Self::embed_one(t, config.dimension))
            .collect())
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
