//! The execution state machine.
//!
//! One [`ExecutionRecord`] tracks one run of the reasoning loop through
//! `IDLE → THINKING → (USING_TOOL → THINKING)* → RESPONDING`, or into
//! `ERROR` from any state. Transition rules live here so every
//! [`ExecutionStore`] enforces the same machine.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Phase of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Thinking,
    UsingTool,
    Responding,
    Error,
}

impl ExecutionStatus {
    /// Whether `self → next` is a legal move. Re-entering the same phase is
    /// allowed for `THINKING` and `RESPONDING` (progress updates).
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (_, Error) => true,
            (Error, _) => false,
            (Idle, Thinking)
            | (Thinking, Thinking)
            | (Thinking, UsingTool)
            | (UsingTool, Thinking)
            | (Thinking, Responding)
            | (Responding, Responding) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::UsingTool => "using_tool",
            Self::Responding => "responding",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Input/output token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input += other.input;
        self.output += other.output;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Optional fields carried alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub progress: Option<u8>,
    pub current_tool: Option<String>,
}

impl StatusUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            current_tool: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.current_tool = Some(tool.into());
        self
    }
}

/// One execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    /// Advisory, 0..=100
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub token_usage: TokenUsage,
}

impl ExecutionRecord {
    pub fn new(agent_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            status: ExecutionStatus::Idle,
            current_tool: None,
            progress: 0,
            start_time: Utc::now(),
            end_time: None,
            token_usage: TokenUsage::default(),
        }
    }

    /// Still running: not finished and not failed.
    pub fn is_active(&self) -> bool {
        self.end_time.is_none() && self.status != ExecutionStatus::Error
    }

    fn reject(&self, to: ExecutionStatus) -> ExecutionError {
        ExecutionError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Move to `next`, applying `update`. Finished records only accept `ERROR`.
    pub fn transition(&mut self, next: ExecutionStatus, update: StatusUpdate) -> Result<(), ExecutionError> {
        if self.end_time.is_some() && next != ExecutionStatus::Error {
            return Err(self.reject(next));
        }
        if !self.status.can_transition_to(next) {
            return Err(self.reject(next));
        }

        self.status = next;
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        self.current_tool = match next {
            ExecutionStatus::UsingTool => update.current_tool,
            _ => None,
        };
        if next == ExecutionStatus::Error && self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Terminal success bookkeeping. Only valid from `RESPONDING`.
    pub fn finish(&mut self, usage: TokenUsage) -> Result<(), ExecutionError> {
        if self.status != ExecutionStatus::Responding || self.end_time.is_some() {
            return Err(self.reject(ExecutionStatus::Responding));
        }
        self.token_usage = usage;
        self.progress = 100;
        self.end_time = Some(Utc::now());
        Ok(())
    }
}

/// Persistence for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an `IDLE` record. Fails if the session already has an active one.
    async fn create(&self, agent_id: &str, session_id: &str) -> Result<ExecutionRecord, ExecutionError>;

    async fn update_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<ExecutionRecord, ExecutionError>;

    async fn finish(&self, id: &str, usage: TokenUsage) -> Result<ExecutionRecord, ExecutionError>;

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, ExecutionError>;

    /// All records for a session, newest first.
    async fn find_by_session(&self, session_id: &str) -> Result<Vec<ExecutionRecord>, ExecutionError>;
}
