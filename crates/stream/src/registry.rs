//! Streaming session registry.
//!
//! The single authoritative table `sessionId -> StreamingSession`. Every
//! mutation goes through a registry method, which updates the session and
//! publishes the matching [`StreamEvent`] to the sink while still holding
//! the table lock, so a session's events reach the sink in the order they
//! were produced.
//!
//! Once a session has emitted `stream_complete` or `stream_error` it is
//! inactive: further chunk/tool/terminal calls for it are ignored with a
//! warning. Inactive sessions stay queryable for a retention period and are
//! then dropped unless a newer execution has reused the session id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentrelay_core::error::ExecutionError;
use agentrelay_core::execution::TokenUsage;
use agentrelay_core::stream_event::{StreamEvent, StreamPayload};
use agentrelay_core::tool::ToolResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sink::EventSink;

/// `stream_error` codes.
pub mod codes {
    /// Fatal failure inside a running loop
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    /// Failure before the loop started (e.g. unknown agent)
    pub const STARTUP_ERROR: &str = "STARTUP_ERROR";
    /// Cancelled through the registry
    pub const CANCELLED: &str = "CANCELLED";
}

/// Message carried by the `stream_error` a cancel produces.
pub const CANCELLED_MESSAGE: &str = "Stream cancelled by user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSession {
    pub session_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub is_active: bool,
    pub accumulated_response: String,
    pub tools_used: Vec<String>,
    pub token_usage: TokenUsage,
}

/// Answer to a status query. Unknown sessions are simply inactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<StreamingSession>,
}

/// How long finished sessions remain queryable.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(5),
            failed: Duration::from_secs(1),
        }
    }
}

type SessionTable = Arc<Mutex<HashMap<String, StreamingSession>>>;

pub struct StreamRegistry {
    sessions: SessionTable,
    sink: Arc<dyn EventSink>,
    retention: RetentionPolicy,
}

impl StreamRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sink,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamingSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on an active session and publish the event it returns.
    /// Returns `false` when the session is unknown or already finished.
    fn with_active<F>(&self, session_id: &str, op: &str, f: F) -> bool
    where
        F: FnOnce(&mut StreamingSession) -> StreamPayload,
    {
        let mut table = self.table();
        let Some(session) = table.get_mut(session_id).filter(|s| s.is_active) else {
            warn!(session_id = %session_id, op, "Ignoring event for inactive or unknown stream session");
            return false;
        };
        let payload = f(session);
        let event = StreamEvent::new(session_id, session.execution_id.clone(), payload);
        self.sink.publish(&event);
        true
    }

    /// Register a new active session and emit `stream_start`.
    pub fn start(
        &self,
        session_id: &str,
        execution_id: &str,
        agent_id: Option<&str>,
        user_id: &str,
        message: &str,
    ) -> Result<StreamingSession, ExecutionError> {
        let mut table = self.table();
        if let Some(existing) = table.get(session_id).filter(|s| s.is_active) {
            return Err(ExecutionError::SessionBusy {
                session_id: session_id.to_string(),
                execution_id: existing.execution_id.clone(),
            });
        }

        let session = StreamingSession {
            session_id: session_id.to_string(),
            execution_id: execution_id.to_string(),
            agent_id: agent_id.map(String::from),
            user_id: user_id.to_string(),
            start_time: Utc::now(),
            is_active: true,
            accumulated_response: String::new(),
            tools_used: Vec::new(),
            token_usage: TokenUsage::default(),
        };
        table.insert(session_id.to_string(), session.clone());

        self.sink.publish(&StreamEvent::new(
            session_id,
            execution_id,
            StreamPayload::Start {
                agent_id: session.agent_id.clone(),
                user_id: user_id.to_string(),
                message: message.to_string(),
            },
        ));
        info!(session_id = %session_id, execution_id = %execution_id, "Stream started");
        Ok(session)
    }

    /// Append a text delta and emit `stream_chunk` with the running total.
    pub fn append_chunk(&self, session_id: &str, chunk: &str, tokens: Option<TokenUsage>) -> bool {
        self.with_active(session_id, "chunk", |s| {
            s.accumulated_response.push_str(chunk);
            StreamPayload::Chunk {
                chunk: chunk.to_string(),
                accumulated: Some(s.accumulated_response.clone()),
                tokens,
            }
        })
    }

    pub fn record_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_params: &serde_json::Value,
        reasoning: Option<&str>,
    ) -> bool {
        self.with_active(session_id, "tool_call", |_| StreamPayload::ToolCall {
            tool_name: tool_name.to_string(),
            tool_params: tool_params.clone(),
            reasoning: reasoning.map(String::from),
        })
    }

    /// Emit `stream_tool_result` and count the tool as used, failed or not.
    pub fn record_tool_result(&self, session_id: &str, tool_name: &str, result: &ToolResult) -> bool {
        self.with_active(session_id, "tool_result", |s| {
            s.tools_used.push(tool_name.to_string());
            StreamPayload::ToolResult {
                tool_name: tool_name.to_string(),
                result: result.data.clone(),
                success: result.success,
                error: result.error.clone(),
            }
        })
    }

    /// Add token counts. Emits nothing.
    pub fn record_usage(&self, session_id: &str, usage: TokenUsage) -> bool {
        let mut table = self.table();
        match table.get_mut(session_id).filter(|s| s.is_active) {
            Some(session) => {
                session.token_usage.add(usage);
                true
            }
            None => false,
        }
    }

    /// Emit `stream_complete` and deactivate the session. The final
    /// response defaults to the accumulated text.
    pub fn complete(&self, session_id: &str, final_response: Option<&str>) -> bool {
        let mut execution_id = String::new();
        let applied = self.with_active(session_id, "complete", |s| {
            s.is_active = false;
            execution_id = s.execution_id.clone();
            let elapsed = Utc::now().signed_duration_since(s.start_time);
            StreamPayload::Complete {
                final_response: final_response
                    .map(String::from)
                    .unwrap_or_else(|| s.accumulated_response.clone()),
                tools_used: s.tools_used.clone(),
                token_usage: s.token_usage,
                execution_time: elapsed.num_milliseconds().max(0) as u64,
            }
        });
        if applied {
            info!(session_id = %session_id, execution_id = %execution_id, "Stream completed");
            self.schedule_removal(session_id, execution_id, self.retention.completed);
        }
        applied
    }

    /// Emit `stream_error` and deactivate the session.
    pub fn error(
        &self,
        session_id: &str,
        message: &str,
        code: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> bool {
        let mut execution_id = String::new();
        let applied = self.with_active(session_id, "error", |s| {
            s.is_active = false;
            execution_id = s.execution_id.clone();
            StreamPayload::Error {
                error: message.to_string(),
                code: code.map(String::from),
                details,
            }
        });
        if applied {
            warn!(session_id = %session_id, execution_id = %execution_id, code = ?code, error = %message, "Stream failed");
            self.schedule_removal(session_id, execution_id, self.retention.failed);
        }
        applied
    }

    /// Advisory cancel: ends the session with a `CANCELLED` error. Does not
    /// interrupt whatever the producer is awaiting. Unknown or finished
    /// sessions are a no-op returning `false`.
    pub fn cancel(&self, session_id: &str) -> bool {
        if !self.is_active(session_id) {
            debug!(session_id = %session_id, "Cancel for inactive or unknown stream session");
            return false;
        }
        self.error(session_id, CANCELLED_MESSAGE, Some(codes::CANCELLED), None)
    }

    pub fn get(&self, session_id: &str) -> Option<StreamingSession> {
        self.table().get(session_id).cloned()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.table().get(session_id).is_some_and(|s| s.is_active)
    }

    pub fn status(&self, session_id: &str) -> StreamStatus {
        let session = self.get(session_id);
        StreamStatus {
            is_active: session.as_ref().is_some_and(|s| s.is_active),
            session,
        }
    }

    /// Active sessions, oldest first.
    pub fn list_active(&self) -> Vec<StreamingSession> {
        let mut active: Vec<_> = self.table().values().filter(|s| s.is_active).cloned().collect();
        active.sort_by_key(|s| s.start_time);
        active
    }

    /// Drop a finished session after `delay`, unless the id was reused.
    fn schedule_removal(&self, session_id: &str, execution_id: String, delay: Duration) {
        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.to_string();
        let remove = move || {
            let mut table = sessions.lock().unwrap_or_else(|e| e.into_inner());
            let stale = table
                .get(&session_id)
                .is_some_and(|s| !s.is_active && s.execution_id == execution_id);
            if stale {
                table.remove(&session_id);
                debug!(session_id = %session_id, "Stream session removed");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !delay.is_zero() => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    remove();
                });
            }
            _ => remove(),
        }
    }
}
