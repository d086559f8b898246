//! LLM capability: the abstraction over model backends.
//!
//! A provider receives a system prompt, a bounded history and the tool
//! catalog, and answers with exactly one [`LlmTurn`]: either plain text or a
//! single tool request. Adapters decode whatever their backend returns into
//! that tagged union, so the reasoning loop never inspects raw model text to
//! make control decisions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::execution::TokenUsage;
use crate::message::Message;

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// Effective system prompt (agent prompt + tools + memory context)
    pub system_prompt: String,

    /// Conversation history, already windowed
    pub messages: Vec<Message>,

    /// Tools the model may request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub input_schema: serde_json::Value,
}

/// A model-directed invocation of a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub tool_name: String,

    #[serde(default)]
    pub tool_params: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// What the model decided to do this turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LlmTurn {
    Text { content: String },
    ToolRequest(ToolRequest),
}

impl LlmTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }
}

/// A complete (non-streaming) answer.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmCompletion {
    pub turn: LlmTurn,
    pub usage: TokenUsage,
}

/// One element of a streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPiece {
    /// Incremental text
    TextDelta(String),
    /// The model asked for a tool; ends the text for this turn
    ToolRequest(ToolRequest),
    /// Token accounting, usually sent last
    Usage(TokenUsage),
}

/// Receiving half of a streamed answer.
pub type PieceStream = mpsc::Receiver<std::result::Result<StreamPiece, ProviderError>>;

/// The core LLM provider trait.
///
/// The reasoning loop calls `complete()` or `stream()` without knowing which
/// backend is behind it.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Send a request and get the decoded turn back.
    async fn complete(&self, request: LlmRequest) -> std::result::Result<LlmCompletion, ProviderError>;

    /// Send a request and receive the turn incrementally.
    ///
    /// Default implementation calls `complete()` and replays the result as
    /// one piece followed by usage.
    async fn stream(&self, request: LlmRequest) -> std::result::Result<PieceStream, ProviderError> {
        let completion = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(2);
        let piece = match completion.turn {
            LlmTurn::Text { content } => StreamPiece::TextDelta(content),
            LlmTurn::ToolRequest(request) => StreamPiece::ToolRequest(request),
        };
        let _ = tx.send(Ok(piece)).await;
        let _ = tx.send(Ok(StreamPiece::Usage(completion.usage))).await;
        Ok(rx)
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}
