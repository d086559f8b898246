//! Background chat processing.
//!
//! A [`ChatJob`] names a session and a message. Jobs with an agent run
//! through the streaming orchestrator. Jobs without one make a single
//! tool-less LLM call and replay the answer into the stream registry in
//! fixed-size word groups with a pause between them.

use std::sync::Arc;
use std::time::Duration;

use agentrelay_config::AppConfig;
use agentrelay_core::error::{Error, ProviderError};
use agentrelay_core::message::{Message, context_window};
use agentrelay_core::provider::{LlmRequest, LlmTurn};
use agentrelay_stream::codes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{build_system_prompt, exchange_summary, recall};
use crate::orchestrator::{ExecutionRequest, Orchestrator, StreamState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatJob {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Earlier turns of the chat, oldest first
    #[serde(default)]
    pub history: Vec<Message>,
}

impl ChatJob {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            message: message.into(),
            agent_id: None,
            system_prompt: None,
            model_id: None,
            temperature: None,
            max_tokens: None,
            history: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub words_per_chunk: usize,
    pub chunk_delay: Duration,
    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: Option<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            words_per_chunk: 5,
            chunk_delay: Duration::from_millis(50),
            default_model: "gpt-4o-mini".into(),
            default_temperature: 0.7,
            default_max_tokens: Some(1024),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            words_per_chunk: config.worker.words_per_chunk,
            chunk_delay: Duration::from_millis(config.worker.chunk_delay_ms),
            default_model: config.default_model.clone(),
            default_temperature: config.default_temperature,
            default_max_tokens: Some(config.default_max_tokens),
        }
    }
}

/// Split `text` into groups of `words_per_chunk` words, each followed by a
/// single space.
pub fn word_groups(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(words_per_chunk.max(1))
        .map(|group| format!("{} ", group.join(" ")))
        .collect()
}

pub struct ChatWorker {
    orchestrator: Orchestrator,
    settings: WorkerSettings,
}

impl ChatWorker {
    pub fn new(orchestrator: Orchestrator, settings: WorkerSettings) -> Self {
        Self { orchestrator, settings }
    }

    /// Handle one job to its terminal stream event. Returns the execution id.
    pub async fn process(&self, job: ChatJob) -> Result<String, Error> {
        info!(session_id = %job.session_id, agent = ?job.agent_id, "Processing chat job");
        match job.agent_id.clone() {
            Some(agent_id) => self.process_with_agent(job, agent_id).await,
            None => self.process_plain(job).await,
        }
    }

    async fn process_with_agent(&self, job: ChatJob, agent_id: String) -> Result<String, Error> {
        let request = ExecutionRequest::new(&agent_id, &job.session_id, &job.user_id, &job.message)
            .with_context(job.history);
        let handle = self.orchestrator.execute_agent_streaming(request).await?;
        if handle.status == StreamState::Error {
            return Err(Error::AgentNotFound(agent_id));
        }
        self.orchestrator.await_stream(&handle.session_id).await;
        Ok(handle.execution_id)
    }

    async fn process_plain(&self, job: ChatJob) -> Result<String, Error> {
        let registry = self.orchestrator.registry();
        let execution_id = Uuid::new_v4().to_string();
        registry.start(&job.session_id, &execution_id, None, &job.user_id, &job.message)?;

        match self.generate(&job).await {
            Ok(text) => {
                self.replay(&job.session_id, &text).await;
                registry.complete(&job.session_id, Some(&text));
                if self.orchestrator.settings().auto_save_memory && !text.is_empty() {
                    let summary = exchange_summary(&job.message, &text);
                    if let Err(e) = self.orchestrator.memory().remember(&job.session_id, &summary).await {
                        warn!(session_id = %job.session_id, "Failed to auto-save exchange to memory: {e}");
                    }
                }
                Ok(execution_id)
            }
            Err(e) => {
                registry.error(&job.session_id, &e.to_string(), Some(codes::EXECUTION_ERROR), None);
                Err(e)
            }
        }
    }

    async fn generate(&self, job: &ChatJob) -> Result<String, Error> {
        let loop_settings = self.orchestrator.settings();
        let memories = recall(
            self.orchestrator.memory().as_ref(),
            &job.session_id,
            &job.message,
            loop_settings.memory_top_k,
        )
        .await;

        let request = LlmRequest {
            model: job
                .model_id
                .clone()
                .unwrap_or_else(|| self.settings.default_model.clone()),
            system_prompt: build_system_prompt(job.system_prompt.as_deref(), &[], &memories),
            messages: context_window(&job.history, loop_settings.context_window, Message::user(&job.message)),
            tools: Vec::new(),
            temperature: job.temperature.unwrap_or(self.settings.default_temperature),
            max_tokens: job.max_tokens.or(self.settings.default_max_tokens),
        };

        let call = self.orchestrator.provider().complete(request);
        let completion = match loop_settings.llm_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ProviderError::Timeout(limit.as_secs()))??,
            None => call.await?,
        };
        self.orchestrator
            .registry()
            .record_usage(&job.session_id, completion.usage);

        match completion.turn {
            LlmTurn::Text { content } => Ok(content),
            LlmTurn::ToolRequest(call) => Err(Error::Internal(format!(
                "model requested tool '{}' in a chat without tools",
                call.tool_name
            ))),
        }
    }

    async fn replay(&self, session_id: &str, text: &str) {
        let registry = self.orchestrator.registry();
        for group in word_groups(text, self.settings.words_per_chunk) {
            if !registry.append_chunk(session_id, &group, None) {
                debug!(session_id = %session_id, "Stream closed during replay");
                return;
            }
            if !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
        }
    }
}

// ── Job queue ────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("chat job queue is full")]
    Full,
    #[error("chat job queue is closed")]
    Closed,
}

/// In-process front end for the worker. Each accepted job runs in its own
/// task so sessions proceed concurrently.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<ChatJob>,
}

impl JobQueue {
    pub fn start(worker: Arc<ChatWorker>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ChatJob>(capacity.max(1));
        let dispatcher = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    let session_id = job.session_id.clone();
                    if let Err(e) = worker.process(job).await {
                        warn!(session_id = %session_id, "Chat job failed: {e}");
                    }
                });
            }
            debug!("Chat job queue closed");
        });
        (Self { tx }, dispatcher)
    }

    pub fn submit(&self, job: ChatJob) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}
