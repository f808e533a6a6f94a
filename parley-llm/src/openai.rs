//! OpenAI-compatible HTTP providers
//!
//! Chat completions are driven in streaming mode (SSE) so tokens reach
//! subscribers as they are generated; tool-call fragments are
//! reassembled here and surfaced whole. Embeddings use the plain JSON
//! endpoint. Both speak to any endpoint implementing the OpenAI wire
//! format (the `base_url` comes from the tenant's API profile).

use crate::{
    ChatMessage, ChatProvider, ChatStreamEvent, EmbeddingProvider, FinishReason, ToolCallRequest,
    ToolSpec,
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use parley_core::{EmbeddingConfig, LlmConfig, LlmError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Debug, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Extract a human-readable message from an error body, falling back to
/// the raw text when it is not the standard `{"error": {...}}` shape.
fn error_message(body: &str) -> String {
    serde_json::from_str::<WireError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(300).collect())
}

// ============================================================================
// CHAT PROVIDER
// ============================================================================

/// Streaming chat client for OpenAI-compatible endpoints.
pub struct OpenAiChatProvider {
    client: reqwest::Client,
}

impl OpenAiChatProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpenAiChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatProvider").finish()
    }
}

/// Accumulates tool-call fragments until the stream finishes.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: Vec<(String, String, String)>, // (id, name, arguments)
}

impl ToolCallAccumulator {
    fn absorb(&mut self, delta: ToolCallDelta) {
        while self.calls.len() <= delta.index {
            self.calls
                .push((String::new(), String::new(), String::new()));
        }
        let slot = &mut self.calls[delta.index];
        if let Some(id) = delta.id {
            slot.0 = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                slot.1 = name;
            }
            if let Some(arguments) = function.arguments {
                slot.2.push_str(&arguments);
            }
        }
    }

    fn into_requests(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, arguments)| ToolCallRequest {
                id,
                name,
                arguments,
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<ChatStreamEvent, LlmError>>, LlmError> {
        let wire_tools: Option<Vec<WireTool<'_>>> = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: t,
                    })
                    .collect(),
            )
        };

        let body = ChatCompletionRequest {
            model: &config.model,
            messages,
            temperature: config.temperature,
            tools: wire_tools,
            stream: true,
        };

        let url = endpoint(&config.base_url, "chat/completions");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport {
                base_url: config.base_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                base_url: config.base_url.clone(),
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        debug!(model = %config.model, "chat stream established");

        let (tx, rx) = mpsc::channel(64);
        let base_url = config.base_url.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut tool_calls = ToolCallAccumulator::default();
            let mut finish: Option<FinishReason> = None;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("chat stream cancelled by caller");
                        return;
                    }
                    next = stream.try_next() => next,
                };

                let bytes = match next {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Transport {
                                base_url: base_url.clone(),
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        finish_stream(tx, tool_calls, finish).await;
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(chunk) => {
                            for choice in chunk.choices {
                                if let Some(content) = choice.delta.content {
                                    if !content.is_empty()
                                        && tx.send(Ok(ChatStreamEvent::Delta(content))).await.is_err()
                                    {
                                        return;
                                    }
                                }
                                if let Some(deltas) = choice.delta.tool_calls {
                                    for delta in deltas {
                                        tool_calls.absorb(delta);
                                    }
                                }
                                if let Some(reason) = choice.finish_reason {
                                    finish = Some(match reason.as_str() {
                                        "stop" => FinishReason::Stop,
                                        "tool_calls" => FinishReason::ToolCalls,
                                        other => FinishReason::Other(other.to_string()),
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable SSE chunk skipped");
                        }
                    }
                }
            }

            // Stream ended without a [DONE] sentinel; still terminate cleanly.
            finish_stream(tx, tool_calls, finish).await;
        });

        Ok(rx)
    }
}

async fn finish_stream(
    tx: mpsc::Sender<Result<ChatStreamEvent, LlmError>>,
    tool_calls: ToolCallAccumulator,
    finish: Option<FinishReason>,
) {
    let requests = tool_calls.into_requests();
    let reason = finish.unwrap_or(if requests.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    });
    for request in requests {
        if tx.send(Ok(ChatStreamEvent::ToolCall(request))).await.is_err() {
            return;
        }
    }
    let _ = tx
        .send(Ok(ChatStreamEvent::Done {
            finish_reason: reason,
        }))
        .await;
}

// ============================================================================
// EMBEDDING PROVIDER
// ============================================================================

/// Embedding client for OpenAI-compatible endpoints.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
}

impl OpenAiEmbeddingProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpenAiEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddingProvider").finish()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &config.model,
            input: texts,
            dimensions: Some(config.dimension),
        };

        let url = endpoint(&config.base_url, "embeddings");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport {
                base_url: config.base_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                base_url: config.base_url.clone(),
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                reason: format!("embedding response: {}", e),
            })?;

        if parsed.data.len() != texts.len() {
            return Err(LlmError::EmbeddingFailed {
                reason: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    parsed.data.len()
                ),
            });
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
