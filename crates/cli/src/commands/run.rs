//! `agentrelay run`: Single-message mode with live streaming output.
//!
//! Wires the same subsystems as the gateway, subscribes a local relay
//! connection to the session and prints events as they arrive.

use std::io::Write;

use agentrelay_agent::{ChatJob, ExecutionRequest, StreamState};
use agentrelay_config::AppConfig;
use agentrelay_core::{StreamEvent, StreamPayload};
use tracing::debug;

pub async fn run(
    message: String,
    agent: Option<String>,
    session: Option<String>,
    user: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let provider = agentrelay_providers::router::build_from_config(&config).map_err(|e| {
        format!(
            "{e}\n  Set AGENTRELAY_API_KEY or OPENAI_API_KEY, or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        )
    })?;
    let state = agentrelay_gateway::build_state(&config, provider);

    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (connection_id, mut events) = state.relay.connect();
    state.relay.subscribe(&connection_id, &session_id, None);
    debug!(session_id = %session_id, connection_id = %connection_id, "Local relay connection subscribed");

    match agent {
        Some(agent_id) => {
            let request = ExecutionRequest::new(agent_id, session_id.as_str(), user, message);
            let handle = state.orchestrator.execute_agent_streaming(request).await?;
            if handle.status == StreamState::Error {
                return Err(handle.error.unwrap_or_else(|| "stream failed to start".into()).into());
            }
        }
        None => {
            state
                .queue
                .submit(ChatJob::new(session_id.as_str(), user, message))
                .map_err(|e| format!("Could not queue chat: {e}"))?;
        }
    }

    let mut stdout = std::io::stdout();
    let mut outcome = Ok(());
    while let Some(event) = events.recv().await {
        if let Some(result) = render(&event, &mut stdout)? {
            outcome = result;
            break;
        }
    }

    state.relay.disconnect(&connection_id);
    outcome.map_err(Into::into)
}

/// Print one event. Returns `Some` once the stream has ended, carrying the
/// error message for a failed stream.
fn render(event: &StreamEvent, out: &mut impl Write) -> std::io::Result<Option<Result<(), String>>> {
    match &event.payload {
        StreamPayload::Start { .. } => {}
        StreamPayload::Chunk { chunk, .. } => {
            write!(out, "{chunk}")?;
            out.flush()?;
        }
        StreamPayload::ToolCall { tool_name, .. } => {
            eprintln!("\n  [tool] {tool_name}");
        }
        StreamPayload::ToolResult {
            tool_name,
            success,
            error,
            ..
        } => {
            if *success {
                eprintln!("  [tool] {tool_name} ok");
            } else {
                eprintln!("  [tool] {tool_name} failed: {}", error.as_deref().unwrap_or("unknown error"));
            }
        }
        StreamPayload::Complete {
            token_usage,
            execution_time,
            ..
        } => {
            writeln!(out)?;
            eprintln!(
                "  ({} tokens in, {} tokens out, {execution_time} ms)",
                token_usage.input, token_usage.output
            );
            return Ok(Some(Ok(())));
        }
        StreamPayload::Error { error, code, .. } => {
            writeln!(out)?;
            let code = code.as_deref().unwrap_or("ERROR");
            return Ok(Some(Err(format!("[{code}] {error}"))));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_core::TokenUsage;

    fn event(payload: StreamPayload) -> StreamEvent {
        StreamEvent::new("s1", "e1", payload)
    }

    #[test]
    fn chunks_are_written_verbatim() {
        let mut out = Vec::new();
        let chunk = event(StreamPayload::Chunk {
            chunk: "Hello ".into(),
            accumulated: None,
            tokens: None,
        });
        assert_eq!(render(&chunk, &mut out).unwrap(), None);
        assert_eq!(String::from_utf8(out).unwrap(), "Hello ");
    }

    #[test]
    fn complete_ends_the_stream() {
        let mut out = Vec::new();
        let done = event(StreamPayload::Complete {
            final_response: "Hello".into(),
            tools_used: vec![],
            token_usage: TokenUsage::new(10, 5),
            execution_time: 12,
        });
        assert_eq!(render(&done, &mut out).unwrap(), Some(Ok(())));
    }

    #[test]
    fn error_carries_code_and_message() {
        let mut out = Vec::new();
        let failed = event(StreamPayload::Error {
            error: "boom".into(),
            code: Some("EXECUTION_ERROR".into()),
            details: None,
        });
        assert_eq!(
            render(&failed, &mut out).unwrap(),
            Some(Err("[EXECUTION_ERROR] boom".into()))
        );
    }
}
