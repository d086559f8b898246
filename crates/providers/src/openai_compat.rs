//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Groq and any
//! endpoint exposing `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Native tool calling, or prompt-mode tool intents for models without it
//! - Health checks

use std::collections::BTreeMap;

use agentrelay_config::ToolMode;
use agentrelay_core::error::ProviderError;
use agentrelay_core::execution::TokenUsage;
use agentrelay_core::message::{Message, Role};
use agentrelay_core::provider::*;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::decode::{PROMPT_TOOL_INSTRUCTIONS, decode_text_turn, native_tool_request};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    tool_mode: ToolMode,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            tool_mode: ToolMode::Native,
            client,
        }
    }

    /// Choose how tools are offered to the model.
    pub fn with_tool_mode(mut self, tool_mode: ToolMode) -> Self {
        self.tool_mode = tool_mode;
        self
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    fn system_prompt(&self, request: &LlmRequest) -> String {
        match self.tool_mode {
            ToolMode::Prompt if !request.tools.is_empty() => {
                format!("{}{}", request.system_prompt, PROMPT_TOOL_INSTRUCTIONS)
            }
            _ => request.system_prompt.clone(),
        }
    }

    /// Convert the request history to OpenAI API format, system prompt first.
    fn to_api_messages(system_prompt: &str, messages: &[Message]) -> Vec<ApiMessage> {
        std::iter::once(ApiMessage {
            role: "system".into(),
            content: Some(system_prompt.to_string()),
            tool_calls: None,
        })
        .chain(messages.iter().map(|m| ApiMessage {
            role: match m.role {
                Role::User => "user".into(),
                Role::Assistant => "assistant".into(),
                Role::System => "system".into(),
            },
            content: Some(m.content.clone()),
            tool_calls: None,
        }))
        .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    fn build_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let system_prompt = self.system_prompt(request);
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&system_prompt, &request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if self.tool_mode == ToolMode::Native && !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }

    async fn post(&self, body: &serde_json::Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }

    fn decode_message(&self, message: ApiMessage) -> Result<LlmTurn, ProviderError> {
        let content = message.content.unwrap_or_default();
        if let Some(call) = message.tool_calls.unwrap_or_default().into_iter().next() {
            return native_tool_request(&call.function.name, &call.function.arguments, Some(content.as_str()))
                .map(LlmTurn::ToolRequest);
        }
        Ok(match self.tool_mode {
            ToolMode::Prompt => decode_text_turn(&content),
            ToolMode::Native => LlmTurn::text(content),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: LlmRequest) -> Result<LlmCompletion, ProviderError> {
        let body = self.build_body(&request, false);
        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode("No choices in response".into()))?;

        let usage = api_response
            .usage
            .map(ApiUsage::into_usage)
            .unwrap_or_default();

        Ok(LlmCompletion {
            turn: self.decode_message(choice.message)?,
            usage,
        })
    }

    async fn stream(&self, request: LlmRequest) -> Result<PieceStream, ProviderError> {
        let body = self.build_body(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&body, true).await?;
        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();
        let mut assembler = TurnAssembler::new(self.tool_mode);

        // Read the SSE byte stream and forward decoded pieces
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLines::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in lines.push(&bytes) {
                    if data == "[DONE]" {
                        for piece in assembler.finish() {
                            let _ = tx.send(piece).await;
                        }
                        return;
                    }

                    match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(stream_resp) => {
                            for piece in assembler.push(stream_resp) {
                                if tx.send(Ok(piece)).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                        }
                        Err(e) => {
                            trace!(
                                provider = %provider_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            for piece in assembler.finish() {
                let _ = tx.send(piece).await;
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

// --- Streaming turn assembly ---

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so a multi-byte character
/// split across network chunks is decoded whole.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Empty lines and SSE comments carry nothing
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim().to_string());
            }
        }

        payloads
    }
}

/// Turns SSE chunks into [`StreamPiece`]s.
///
/// Native mode forwards text deltas as they arrive and accumulates tool call
/// fragments until the end of the stream. Prompt mode forwards prose until
/// the first `{`, then holds the rest back; at the end the whole reply is
/// decoded, and either the tool intent or the held text is emitted.
struct TurnAssembler {
    mode: ToolMode,
    text: String,
    /// Bytes of `text` already forwarded as deltas (prompt mode).
    released: usize,
    holding: bool,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    usage: Option<TokenUsage>,
}

impl TurnAssembler {
    fn new(mode: ToolMode) -> Self {
        Self {
            mode,
            text: String::new(),
            released: 0,
            holding: false,
            tool_calls: BTreeMap::new(),
            usage: None,
        }
    }

    fn push(&mut self, chunk: StreamResponse) -> Vec<StreamPiece> {
        let mut pieces = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into_usage());
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return pieces;
        };

        for tc_delta in choice.delta.tool_calls.unwrap_or_default() {
            let acc = self.tool_calls.entry(tc_delta.index).or_default();
            if let Some(func) = tc_delta.function {
                if let Some(name) = func.name {
                    acc.name = name;
                }
                if let Some(args) = func.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.text.push_str(&content);
            match self.mode {
                ToolMode::Native => pieces.push(StreamPiece::TextDelta(content)),
                ToolMode::Prompt => pieces.extend(self.release_prose()),
            }
        }

        pieces
    }

    /// Prompt mode: forward unreleased text up to the first `{`. Leading
    /// whitespace waits for the next visible character.
    fn release_prose(&mut self) -> Option<StreamPiece> {
        if self.holding {
            return None;
        }
        let pending = &self.text[self.released..];
        let end = match pending.find('{') {
            Some(brace) => {
                self.holding = true;
                self.released + brace
            }
            None => self.text.len(),
        };
        let ready = &self.text[self.released..end];
        if ready.trim().is_empty() {
            return None;
        }
        let piece = StreamPiece::TextDelta(ready.to_string());
        self.released = end;
        Some(piece)
    }

    fn finish(&mut self) -> Vec<Result<StreamPiece, ProviderError>> {
        let mut pieces = Vec::new();

        if let Some((_, call)) = self.tool_calls.iter().next() {
            pieces.push(
                native_tool_request(&call.name, &call.arguments, Some(self.text.as_str()))
                    .map(StreamPiece::ToolRequest),
            );
        } else if self.mode == ToolMode::Prompt {
            match decode_text_turn(&self.text) {
                LlmTurn::ToolRequest(request) => pieces.push(Ok(StreamPiece::ToolRequest(request))),
                LlmTurn::Text { .. } => {
                    let rest = &self.text[self.released..];
                    if !rest.is_empty() {
                        pieces.push(Ok(StreamPiece::TextDelta(rest.to_string())));
                    }
                    self.released = self.text.len();
                }
            }
        }

        if let Some(usage) = self.usage.take() {
            pieces.push(Ok(StreamPiece::Usage(usage)));
        }
        pieces
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    name: String,
    arguments: String,
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl ApiUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(self.prompt_tokens, self.completion_tokens)
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
