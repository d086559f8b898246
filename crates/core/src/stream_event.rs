//! Wire events for a streaming execution.
//!
//! Every event carries the `{sessionId, executionId, timestamp}` envelope
//! and a `type`-tagged payload under `data`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub session_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: StreamPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StreamPayload {
    #[serde(rename = "stream_start", rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        user_id: String,
        message: String,
    },

    #[serde(rename = "stream_chunk", rename_all = "camelCase")]
    Chunk {
        chunk: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accumulated: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenUsage>,
    },

    #[serde(rename = "stream_tool_call", rename_all = "camelCase")]
    ToolCall {
        tool_name: String,
        tool_params: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },

    #[serde(rename = "stream_tool_result", rename_all = "camelCase")]
    ToolResult {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "stream_complete", rename_all = "camelCase")]
    Complete {
        final_response: String,
        tools_used: Vec<String>,
        token_usage: TokenUsage,
        /// Milliseconds since the stream started
        execution_time: u64,
    },

    #[serde(rename = "stream_error", rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl StreamEvent {
    pub fn new(session_id: impl Into<String>, execution_id: impl Into<String>, payload: StreamPayload) -> Self {
        Self {
            session_id: session_id.into(),
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// `stream_complete` and `stream_error` end a session's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, StreamPayload::Complete { .. } | StreamPayload::Error { .. })
    }

    /// The wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            StreamPayload::Start { .. } => "stream_start",
            StreamPayload::Chunk { .. } => "stream_chunk",
            StreamPayload::ToolCall { .. } => "stream_tool_call",
            StreamPayload::ToolResult { .. } => "stream_tool_result",
            StreamPayload::Complete { .. } => "stream_complete",
            StreamPayload::Error { .. } => "stream_error",
        }
    }
}
