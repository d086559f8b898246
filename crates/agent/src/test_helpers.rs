//! Shared test doubles for orchestrator and worker tests.

use std::sync::Mutex;
use std::time::Duration;

use agentrelay_core::error::{ProviderError, ToolError};
use agentrelay_core::execution::TokenUsage;
use agentrelay_core::provider::{
    LlmCompletion, LlmProvider, LlmRequest, LlmTurn, PieceStream, StreamPiece, ToolRequest,
};
use agentrelay_core::tool::{Tool, ToolResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One scripted provider answer.
#[derive(Clone)]
pub enum Script {
    Reply(LlmTurn),
    Fail(ProviderError),
    /// Never answers
    Stall,
}

pub fn text(content: &str) -> Script {
    Script::Reply(LlmTurn::text(content))
}

pub fn tool(name: &str, params: serde_json::Value) -> Script {
    Script::Reply(LlmTurn::ToolRequest(ToolRequest {
        tool_name: name.into(),
        tool_params: params,
        reasoning: None,
    }))
}

pub const USAGE_PER_CALL: TokenUsage = TokenUsage { input: 10, output: 5 };

/// A provider that answers from a script, one entry per call.
///
/// Streaming replays text word by word. Running past the end of the script
/// is a provider error rather than a panic so detached tasks fail visibly.
pub struct ScriptedProvider {
    script: Mutex<Vec<Script>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: LlmRequest) -> Script {
        let mut requests = self.requests.lock().unwrap();
        let index = requests.len();
        requests.push(request);
        let script = self.script.lock().unwrap();
        script.get(index).cloned().unwrap_or_else(|| {
            Script::Fail(ProviderError::NotConfigured(format!(
                "script exhausted at call #{index}"
            )))
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: LlmRequest) -> Result<LlmCompletion, ProviderError> {
        match self.next(request) {
            Script::Reply(turn) => Ok(LlmCompletion { turn, usage: USAGE_PER_CALL }),
            Script::Fail(e) => Err(e),
            Script::Stall => std::future::pending().await,
        }
    }

    async fn stream(&self, request: LlmRequest) -> Result<PieceStream, ProviderError> {
        let turn = match self.next(request) {
            Script::Reply(turn) => turn,
            Script::Fail(e) => return Err(e),
            Script::Stall => return std::future::pending().await,
        };

        let mut pieces = Vec::new();
        match turn {
            LlmTurn::Text { content } => {
                pieces.extend(content.split_inclusive(' ').map(|w| StreamPiece::TextDelta(w.to_string())));
            }
            LlmTurn::ToolRequest(request) => {
                if let Some(reasoning) = &request.reasoning {
                    pieces.push(StreamPiece::TextDelta(reasoning.clone()));
                }
                pieces.push(StreamPiece::ToolRequest(request));
            }
        }
        pieces.push(StreamPiece::Usage(USAGE_PER_CALL));

        let (tx, rx) = mpsc::channel(pieces.len());
        for piece in pieces {
            let _ = tx.send(Ok(piece)).await;
        }
        Ok(rx)
    }
}

/// A tool that always fails with the given message.
pub struct FailingTool {
    pub name: &'static str,
    pub message: &'static str,
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::failure(self.message))
    }
}

/// A tool that sleeps before answering.
pub struct SlowTool {
    pub delay: Duration,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes its input"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(ToolResult::ok(arguments))
    }
}
