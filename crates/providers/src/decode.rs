//! Typed decoding of model output into [`LlmTurn`].
//!
//! Two shapes are supported:
//! - native tool calls (`tool_calls` array on the assistant message), of
//!   which only the first is honoured since the loop runs one tool per
//!   iteration;
//! - prompt-mode intents, where the model was instructed to answer with a
//!   `{"tool": "...", "params": {...}}` object somewhere in its text.

use agentrelay_core::error::ProviderError;
use agentrelay_core::provider::{LlmTurn, ToolRequest};
use serde::Deserialize;

/// Instruction appended to the system prompt in prompt mode.
pub const PROMPT_TOOL_INSTRUCTIONS: &str = "\nTo use a tool, respond with JSON in this format: \
{\"tool\": \"tool_name\", \"params\": {...}}\nIf you don't need to use any tools, respond normally.";

/// A tool intent embedded in reply text.
#[derive(Debug, Deserialize)]
struct TextIntent {
    tool: String,
    params: serde_json::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Decode a native tool call. `arguments` is the raw JSON string the API
/// returned; an empty string means "no arguments".
pub fn native_tool_request(
    name: &str,
    arguments: &str,
    content: Option<&str>,
) -> Result<ToolRequest, ProviderError> {
    let tool_params = if arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(arguments).map_err(|e| {
            ProviderError::Decode(format!("tool '{name}' arguments are not valid JSON: {e}"))
        })?
    };

    Ok(ToolRequest {
        tool_name: name.to_string(),
        tool_params,
        reasoning: content.and_then(non_empty),
    })
}

/// Decode reply text that may carry a prompt-mode tool intent.
///
/// The first JSON object in the text that deserializes as an intent wins;
/// any prose before it becomes the request's reasoning. Text without an
/// intent is returned unchanged as [`LlmTurn::Text`].
pub fn decode_text_turn(text: &str) -> LlmTurn {
    for (start, _) in text.match_indices('{') {
        let mut values =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<TextIntent>();
        if let Some(Ok(intent)) = values.next() {
            if intent.tool.is_empty() {
                continue;
            }
            return LlmTurn::ToolRequest(ToolRequest {
                tool_name: intent.tool,
                tool_params: intent.params,
                reasoning: intent.reasoning.or_else(|| non_empty(&text[..start])),
            });
        }
    }
    LlmTurn::text(text)
}
