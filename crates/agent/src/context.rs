//! Context and prompt assembly for one execution.

use agentrelay_core::memory::{MemorySearch, MemorySnippet};
use agentrelay_core::message::Message;
use agentrelay_core::provider::{ToolDefinition, ToolRequest};
use agentrelay_core::tool::ToolResult;
use tracing::{debug, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Agent prompt, then the tool catalog, then recalled memory.
pub fn build_system_prompt(
    agent_prompt: Option<&str>,
    tools: &[ToolDefinition],
    memories: &[MemorySnippet],
) -> String {
    let mut prompt = agent_prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string();

    if !tools.is_empty() {
        prompt.push_str("\n\nYou have access to the following tools:");
        for tool in tools {
            prompt.push_str(&format!("\n- {}: {}", tool.name, tool.description));
        }
    }

    if !memories.is_empty() {
        prompt.push_str("\n\nRelevant past context:");
        for memory in memories {
            prompt.push_str(&format!("\n- {}", memory.content));
        }
    }

    prompt
}

/// Best-effort memory lookup. Failures are logged and yield nothing.
pub async fn recall(
    memory: &dyn MemorySearch,
    session_id: &str,
    query: &str,
    top_k: usize,
) -> Vec<MemorySnippet> {
    if top_k == 0 {
        return Vec::new();
    }
    match memory.search(session_id, query, top_k).await {
        Ok(snippets) => {
            if !snippets.is_empty() {
                debug!(session_id = %session_id, count = snippets.len(), "Recalled memories for context");
            }
            snippets
        }
        Err(e) => {
            warn!(session_id = %session_id, backend = memory.name(), "Memory recall failed: {e}");
            Vec::new()
        }
    }
}

/// The two history turns a tool round leaves behind.
pub fn tool_round_turns(call: &ToolRequest, result: &ToolResult) -> [Message; 2] {
    let invocation = Message::assistant(format!(
        "Using tool {} with params: {}",
        call.tool_name, call.tool_params
    ));
    let outcome = if result.success {
        let rendered = serde_json::to_string(result).unwrap_or_else(|_| "{}".into());
        Message::system(format!("Tool result: {rendered}"))
    } else {
        Message::system(format!(
            "Tool execution failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ))
    };
    [invocation, outcome]
}

/// Text stored into memory after a successful exchange.
pub fn exchange_summary(user_message: &str, response: &str) -> String {
    format!("User: {user_message}\nAssistant: {response}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_core::error::MemoryError;
    use agentrelay_core::message::Role;
    use async_trait::async_trait;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn default_prompt_when_agent_has_none() {
        assert_eq!(build_system_prompt(None, &[], &[]), DEFAULT_SYSTEM_PROMPT);
        assert_eq!(build_system_prompt(Some("  "), &[], &[]), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn prompt_lists_tools_then_memories() {
        let prompt = build_system_prompt(
            Some("You are Math."),
            &[tool("calculator", "Evaluates arithmetic")],
            &[MemorySnippet { content: "User prefers metric".into(), score: 0.9 }],
        );
        assert_eq!(
            prompt,
            "You are Math.\n\nYou have access to the following tools:\n- calculator: Evaluates arithmetic\n\nRelevant past context:\n- User prefers metric"
        );
    }

    #[test]
    fn successful_tool_round() {
        let call = ToolRequest {
            tool_name: "calculator".into(),
            tool_params: json!({"expression": "2+2"}),
            reasoning: None,
        };
        let [invocation, outcome] = tool_round_turns(&call, &ToolResult::ok(json!({"result": 4})));
        assert_eq!(invocation.role, Role::Assistant);
        assert_eq!(invocation.content, r#"Using tool calculator with params: {"expression":"2+2"}"#);
        assert_eq!(outcome.role, Role::System);
        assert_eq!(outcome.content, r#"Tool result: {"success":true,"data":{"result":4}}"#);
    }

    #[test]
    fn failed_tool_round() {
        let call = ToolRequest {
            tool_name: "calculator".into(),
            tool_params: json!({}),
            reasoning: None,
        };
        let [_, outcome] = tool_round_turns(&call, &ToolResult::failure("boom"));
        assert_eq!(outcome.content, "Tool execution failed: boom");
    }

    struct BrokenMemory;

    #[async_trait]
    impl MemorySearch for BrokenMemory {
        fn name(&self) -> &str {
            "broken"
        }
        async fn search(&self, _: &str, _: &str, _: usize) -> Result<Vec<MemorySnippet>, MemoryError> {
            Err(MemoryError::QueryFailed("index offline".into()))
        }
        async fn remember(&self, _: &str, _: &str) -> Result<(), MemoryError> {
            Err(MemoryError::Storage("index offline".into()))
        }
    }

    #[tokio::test]
    async fn recall_failure_yields_nothing() {
        assert!(recall(&BrokenMemory, "s1", "anything", 5).await.is_empty());
    }
}
