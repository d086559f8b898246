//! The reasoning loop.
//!
//! An execution resolves the agent, assembles the prompt, then iterates:
//! think (one LLM call), and when the model asks for a tool, run it, append
//! the round to the history and think again. A plain-text answer ends the
//! loop. The iteration count is bounded; running out of iterations ends the
//! loop with whatever text the model produced last.
//!
//! The blocking and streaming entry points share the same loop. In
//! streaming mode every text delta, tool call and tool result is pushed
//! into the [`StreamRegistry`] as it happens, and the loop runs as a
//! detached task whose suspension points all race a cancellation token.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agentrelay_config::AppConfig;
use agentrelay_core::agent::{AgentDirectory, AgentProfile};
use agentrelay_core::error::{Error, ProviderError};
use agentrelay_core::execution::{ExecutionStatus, ExecutionStore, StatusUpdate, TokenUsage};
use agentrelay_core::memory::MemorySearch;
use agentrelay_core::message::{Message, context_window};
use agentrelay_core::provider::{LlmCompletion, LlmProvider, LlmRequest, LlmTurn, StreamPiece};
use agentrelay_core::tool::ToolRegistry;
use agentrelay_stream::{StreamRegistry, StreamStatus, codes};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{build_system_prompt, exchange_summary, recall, tool_round_turns};

// ── Settings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: u32,
    /// Prior turns kept in front of the new user message
    pub context_window: usize,
    pub memory_top_k: usize,
    pub llm_timeout: Option<Duration>,
    /// Default pause between streamed deltas
    pub chunk_delay: Duration,
    pub auto_save_memory: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            context_window: 10,
            memory_top_k: 5,
            llm_timeout: Some(Duration::from_secs(120)),
            chunk_delay: Duration::ZERO,
            auto_save_memory: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.orchestrator.max_iterations,
            context_window: config.orchestrator.context_window,
            memory_top_k: config.orchestrator.memory_top_k,
            llm_timeout: config.orchestrator.llm_timeout(),
            chunk_delay: Duration::from_millis(config.streaming.chunk_delay_ms),
            auto_save_memory: config.orchestrator.auto_save_memory,
        }
    }
}

// ── Requests and results ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingOptions {
    /// Overrides the configured pause between deltas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub agent_id: String,
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    /// Prior conversation turns, oldest first
    #[serde(default)]
    pub context: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_options: Option<StreamingOptions>,
}

impl ExecutionRequest {
    pub fn new(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            message: message.into(),
            context: Vec::new(),
            streaming_options: None,
        }
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }

    pub fn with_chunk_delay(mut self, delay_ms: u64) -> Self {
        self.streaming_options = Some(StreamingOptions {
            chunk_delay_ms: Some(delay_ms),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub response: String,
    pub tools_used: Vec<String>,
    pub token_usage: TokenUsage,
    pub status: ExecutionStatus,
    pub iterations: u32,
    /// The loop ran out of iterations before a plain-text answer
    pub iteration_limit_reached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Streaming,
    Error,
}

/// What the caller of a streaming execution gets back immediately.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingHandle {
    pub execution_id: String,
    pub session_id: String,
    pub status: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Delivery {
    Blocking,
    Streaming { chunk_delay: Duration },
}

struct LoopOutput {
    response: String,
    tools_used: Vec<String>,
    usage: TokenUsage,
    iterations: u32,
    limit_reached: bool,
}

struct ActiveStream {
    execution_id: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    agents: Arc<dyn AgentDirectory>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ExecutionStore>,
    memory: Arc<dyn MemorySearch>,
    registry: Arc<StreamRegistry>,
    settings: OrchestratorSettings,
    active: Arc<Mutex<HashMap<String, ActiveStream>>>,
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    session_id: &str,
    work: impl Future<Output = T>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled { session_id: session_id.to_string() }),
        out = work => Ok(out),
    }
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        agents: Arc<dyn AgentDirectory>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ExecutionStore>,
        memory: Arc<dyn MemorySearch>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            provider,
            agents,
            tools,
            store,
            memory,
            registry,
            settings: OrchestratorSettings::default(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub(crate) fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub(crate) fn memory(&self) -> &Arc<dyn MemorySearch> {
        &self.memory
    }

    fn active_streams(&self) -> MutexGuard<'_, HashMap<String, ActiveStream>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run an execution to completion and return its outcome.
    ///
    /// Fatal failures mark the record `ERROR` before the error is returned.
    pub async fn execute_agent(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, Error> {
        info!(
            agent_id = %request.agent_id,
            session_id = %request.session_id,
            "Starting agent execution"
        );
        let record = self.store.create(&request.agent_id, &request.session_id).await?;
        let cancel = CancellationToken::new();

        let result = async {
            let profile = self.resolve_agent(&request.agent_id).await?;
            self.drive(&record.id, &profile, &request, Delivery::Blocking, &cancel).await
        }
        .await;

        match result {
            Ok(outcome) => {
                info!(
                    execution_id = %outcome.execution_id,
                    iterations = outcome.iterations,
                    tools = outcome.tools_used.len(),
                    "Agent execution completed"
                );
                self.remember_exchange(&request, &outcome.response).await;
                Ok(outcome)
            }
            Err(e) => {
                error!(execution_id = %record.id, session_id = %request.session_id, "Agent execution failed: {e}");
                self.mark_failed(&record.id).await;
                Err(e)
            }
        }
    }

    /// Start an execution in the background and return at once.
    ///
    /// A busy session is an error. An unknown agent is reported through a
    /// `STARTUP_ERROR` stream event and an `error` handle. Everything after
    /// that reaches the caller only as stream events.
    pub async fn execute_agent_streaming(&self, request: ExecutionRequest) -> Result<StreamingHandle, Error> {
        info!(
            agent_id = %request.agent_id,
            session_id = %request.session_id,
            "Starting streaming agent execution"
        );
        let record = self.store.create(&request.agent_id, &request.session_id).await?;
        let session_id = request.session_id.clone();

        if let Err(e) = self.registry.start(
            &session_id,
            &record.id,
            Some(&request.agent_id),
            &request.user_id,
            &request.message,
        ) {
            self.mark_failed(&record.id).await;
            return Err(e.into());
        }

        let profile = match self.resolve_agent(&request.agent_id).await {
            Ok(profile) => profile,
            Err(e) => {
                let message = e.to_string();
                warn!(session_id = %session_id, "Failed to start streaming execution: {message}");
                self.mark_failed(&record.id).await;
                self.registry.error(&session_id, &message, Some(codes::STARTUP_ERROR), None);
                return Ok(StreamingHandle {
                    execution_id: record.id,
                    session_id,
                    status: StreamState::Error,
                    error: Some(message),
                });
            }
        };

        let chunk_delay = request
            .streaming_options
            .as_ref()
            .and_then(|o| o.chunk_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.settings.chunk_delay);
        let token = CancellationToken::new();

        {
            let mut active = self.active_streams();
            let task = tokio::spawn(self.clone().run_streaming(
                record.id.clone(),
                profile,
                request,
                chunk_delay,
                token.clone(),
            ));
            active.insert(
                session_id.clone(),
                ActiveStream {
                    execution_id: record.id.clone(),
                    token,
                    task: Some(task),
                },
            );
        }

        Ok(StreamingHandle {
            execution_id: record.id,
            session_id,
            status: StreamState::Streaming,
            error: None,
        })
    }

    /// Cancel a streaming execution. The registry session ends with a
    /// `CANCELLED` error and the detached loop stops at its current
    /// suspension point. Unknown sessions return `false`.
    pub fn cancel_streaming_execution(&self, session_id: &str) -> bool {
        let cancelled = self.registry.cancel(session_id);
        let token = self.active_streams().get(session_id).map(|a| a.token.clone());
        if let Some(token) = &token {
            token.cancel();
        }
        let found = cancelled || token.is_some();
        if found {
            info!(session_id = %session_id, "Streaming execution cancelled");
        }
        found
    }

    pub fn get_streaming_status(&self, session_id: &str) -> StreamStatus {
        self.registry.status(session_id)
    }

    /// Wait for the detached task of a session to finish. Returns
    /// immediately when nothing is running for it.
    pub async fn await_stream(&self, session_id: &str) {
        let task = self
            .active_streams()
            .get_mut(session_id)
            .and_then(|a| a.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(session_id = %session_id, "Streaming task ended abnormally: {e}");
            }
        }
    }

    /// Fire the cancellation token of every running stream.
    pub fn cancel_all(&self) {
        for (session_id, stream) in self.active_streams().iter() {
            debug!(session_id = %session_id, "Cancelling stream on shutdown");
            stream.token.cancel();
        }
    }

    // ── Internals ──

    async fn resolve_agent(&self, agent_id: &str) -> Result<AgentProfile, Error> {
        self.agents
            .get_agent(agent_id)
            .await
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    async fn mark_failed(&self, execution_id: &str) {
        if let Err(e) = self
            .store
            .update_status(execution_id, ExecutionStatus::Error, StatusUpdate::default())
            .await
        {
            warn!(execution_id = %execution_id, "Failed to mark execution as failed: {e}");
        }
    }

    /// Store the finished exchange in session memory when auto-save is on.
    /// Failures are logged and ignored.
    async fn remember_exchange(&self, request: &ExecutionRequest, response: &str) {
        if !self.settings.auto_save_memory || response.is_empty() {
            return;
        }
        let summary = exchange_summary(&request.message, response);
        if let Err(e) = self.memory.remember(&request.session_id, &summary).await {
            warn!(session_id = %request.session_id, "Failed to auto-save exchange to memory: {e}");
        }
    }

    async fn run_streaming(
        self,
        execution_id: String,
        profile: AgentProfile,
        request: ExecutionRequest,
        chunk_delay: Duration,
        cancel: CancellationToken,
    ) {
        let session_id = request.session_id.clone();
        let delivery = Delivery::Streaming { chunk_delay };

        match self.drive(&execution_id, &profile, &request, delivery, &cancel).await {
            Ok(outcome) => {
                if self.registry.complete(&session_id, Some(&outcome.response)) {
                    info!(
                        execution_id = %execution_id,
                        session_id = %session_id,
                        iterations = outcome.iterations,
                        "Streaming agent execution completed"
                    );
                    self.remember_exchange(&request, &outcome.response).await;
                } else {
                    // Cancelled after the record was finished: the stream
                    // already ended with `stream_error`, so the record follows.
                    self.mark_failed(&execution_id).await;
                    info!(execution_id = %execution_id, session_id = %session_id, "Streaming execution stopped");
                }
            }
            Err(e) => {
                self.mark_failed(&execution_id).await;
                match e {
                    Error::Cancelled { .. } => {
                        self.registry.cancel(&session_id);
                        info!(execution_id = %execution_id, session_id = %session_id, "Streaming execution stopped");
                    }
                    e => {
                        error!(execution_id = %execution_id, session_id = %session_id, "Streaming execution failed: {e}");
                        self.registry
                            .error(&session_id, &e.to_string(), Some(codes::EXECUTION_ERROR), None);
                    }
                }
            }
        }

        let mut active = self.active_streams();
        if active
            .get(&session_id)
            .is_some_and(|a| a.execution_id == execution_id)
        {
            active.remove(&session_id);
        }
    }

    /// Everything between agent resolution and the final record update.
    async fn drive(
        &self,
        execution_id: &str,
        profile: &AgentProfile,
        request: &ExecutionRequest,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, Error> {
        let session_id = request.session_id.as_str();
        let tools = self.tools.definitions();
        let history = context_window(
            &request.context,
            self.settings.context_window,
            Message::user(&request.message),
        );
        let memories = until_cancelled(
            cancel,
            session_id,
            recall(self.memory.as_ref(), session_id, &request.message, self.settings.memory_top_k),
        )
        .await?;

        let template = LlmRequest {
            model: profile.model_id.clone(),
            system_prompt: build_system_prompt(profile.system_prompt.as_deref(), &tools, &memories),
            messages: history,
            tools,
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
        };

        let output = self
            .run_loop(execution_id, session_id, template, delivery, cancel)
            .await?;

        if output.limit_reached {
            warn!(
                execution_id = %execution_id,
                iterations = output.iterations,
                "Iteration limit reached without a final answer, using last text"
            );
            self.store
                .update_status(execution_id, ExecutionStatus::Thinking, StatusUpdate::progress(50))
                .await?;
        }
        self.store
            .update_status(execution_id, ExecutionStatus::Responding, StatusUpdate::progress(90))
            .await?;
        let record = self.store.finish(execution_id, output.usage).await?;

        Ok(ExecutionOutcome {
            execution_id: execution_id.to_string(),
            response: output.response,
            tools_used: output.tools_used,
            token_usage: output.usage,
            status: record.status,
            iterations: output.iterations,
            iteration_limit_reached: output.limit_reached,
        })
    }

    async fn run_loop(
        &self,
        execution_id: &str,
        session_id: &str,
        mut request: LlmRequest,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<LoopOutput, Error> {
        let max_iterations = self.settings.max_iterations;
        let streaming = matches!(delivery, Delivery::Streaming { .. });
        let mut output = LoopOutput {
            response: String::new(),
            tools_used: Vec::new(),
            usage: TokenUsage::default(),
            iterations: 0,
            limit_reached: true,
        };

        while output.iterations < max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    session_id: session_id.to_string(),
                });
            }
            output.iterations += 1;
            let iteration = output.iterations;
            let progress = (iteration * 50 / max_iterations) as u8;
            self.store
                .update_status(execution_id, ExecutionStatus::Thinking, StatusUpdate::progress(progress))
                .await?;
            debug!(execution_id = %execution_id, iteration, "Agent loop iteration");

            let completion =
                until_cancelled(cancel, session_id, self.invoke_llm(request.clone(), session_id, delivery))
                    .await??;
            output.usage.add(completion.usage);
            if streaming {
                self.registry.record_usage(session_id, completion.usage);
            }

            let call = match completion.turn {
                LlmTurn::Text { content } => {
                    output.response = content;
                    output.limit_reached = false;
                    break;
                }
                LlmTurn::ToolRequest(call) => call,
            };

            if let Some(reasoning) = &call.reasoning {
                output.response = reasoning.clone();
            }
            if streaming {
                self.registry.record_tool_call(
                    session_id,
                    &call.tool_name,
                    &call.tool_params,
                    call.reasoning.as_deref(),
                );
            }
            self.store
                .update_status(
                    execution_id,
                    ExecutionStatus::UsingTool,
                    StatusUpdate::progress(60).with_tool(&call.tool_name),
                )
                .await?;
            info!(execution_id = %execution_id, tool = %call.tool_name, iteration, "Agent using tool");

            let result = until_cancelled(
                cancel,
                session_id,
                self.tools.execute(&call.tool_name, call.tool_params.clone()),
            )
            .await?;
            if !result.success {
                warn!(tool = %call.tool_name, error = ?result.error, "Tool returned a failure");
            }

            output.tools_used.push(call.tool_name.clone());
            if streaming {
                self.registry.record_tool_result(session_id, &call.tool_name, &result);
            }
            request.messages.extend(tool_round_turns(&call, &result));
        }

        Ok(output)
    }

    /// One LLM call, bounded by the configured timeout.
    async fn invoke_llm(
        &self,
        request: LlmRequest,
        session_id: &str,
        delivery: Delivery,
    ) -> Result<LlmCompletion, ProviderError> {
        let call = async {
            match delivery {
                Delivery::Blocking => self.provider.complete(request).await,
                Delivery::Streaming { chunk_delay } => {
                    self.stream_turn(request, session_id, chunk_delay).await
                }
            }
        };
        match self.settings.llm_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ProviderError::Timeout(limit.as_secs()))?,
            None => call.await,
        }
    }

    /// Forward text deltas to the registry as they arrive and fold the
    /// pieces into one completion. Text streamed before a tool request
    /// becomes that request's reasoning.
    async fn stream_turn(
        &self,
        request: LlmRequest,
        session_id: &str,
        chunk_delay: Duration,
    ) -> Result<LlmCompletion, ProviderError> {
        let mut pieces = self.provider.stream(request).await?;
        let mut text = String::new();
        let mut tool_request = None;
        let mut usage = TokenUsage::default();

        while let Some(piece) = pieces.recv().await {
            match piece? {
                StreamPiece::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    self.registry.append_chunk(session_id, &delta, None);
                    if !chunk_delay.is_zero() {
                        tokio::time::sleep(chunk_delay).await;
                    }
                }
                StreamPiece::ToolRequest(call) => tool_request = Some(call),
                StreamPiece::Usage(u) => usage.add(u),
            }
        }

        let turn = match tool_request {
            Some(mut call) => {
                let reasoning = text.trim();
                if call.reasoning.is_none() && !reasoning.is_empty() {
                    call.reasoning = Some(reasoning.to_string());
                }
                LlmTurn::ToolRequest(call)
            }
            None => LlmTurn::Text { content: text },
        };
        Ok(LlmCompletion { turn, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticAgentDirectory;
    use crate::store::InMemoryExecutionStore;
    use crate::test_helpers::{FailingTool, Script, ScriptedProvider, SlowTool, USAGE_PER_CALL, text, tool};
    use agentrelay_core::error::ExecutionError;
    use agentrelay_core::message::Role;
    use agentrelay_core::stream_event::StreamPayload;
    use agentrelay_memory::InMemorySearch;
    use agentrelay_stream::{CANCELLED_MESSAGE, RecordingSink};
    use agentrelay_tools::default_registry;
    use serde_json::json;

    struct Fixture {
        orchestrator: Orchestrator,
        provider: Arc<ScriptedProvider>,
        store: Arc<InMemoryExecutionStore>,
        sink: Arc<RecordingSink>,
        memory: Arc<InMemorySearch>,
    }

    fn profile() -> AgentProfile {
        AgentProfile {
            id: "math".into(),
            name: "Math".into(),
            system_prompt: Some("You solve arithmetic.".into()),
            model_id: "test-model".into(),
            temperature: 0.1,
            max_tokens: Some(256),
        }
    }

    fn fixture_with(script: Vec<Script>, tools: ToolRegistry, settings: OrchestratorSettings) -> Fixture {
        let provider = Arc::new(ScriptedProvider::new(script));
        let store = Arc::new(InMemoryExecutionStore::new());
        let sink = Arc::new(RecordingSink::new());
        let memory = Arc::new(InMemorySearch::new());
        let registry = Arc::new(StreamRegistry::new(sink.clone()));
        let orchestrator = Orchestrator::new(
            provider.clone(),
            Arc::new(StaticAgentDirectory::new([profile()])),
            Arc::new(tools),
            store.clone(),
            memory.clone(),
            registry,
        )
        .with_settings(settings);
        Fixture { orchestrator, provider, store, sink, memory }
    }

    fn fixture(script: Vec<Script>) -> Fixture {
        fixture_with(script, default_registry(), OrchestratorSettings::default())
    }

    fn request(session: &str, message: &str) -> ExecutionRequest {
        ExecutionRequest::new("math", session, "user-1", message)
    }

    fn calc(expression: &str) -> Script {
        tool("calculator", json!({ "expression": expression }))
    }

    // ── Blocking ──

    #[tokio::test]
    async fn plain_text_answer_takes_one_iteration() {
        let f = fixture(vec![text("Hello there!")]);
        let outcome = f.orchestrator.execute_agent(request("s1", "hi")).await.unwrap();

        assert_eq!(outcome.response, "Hello there!");
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.tools_used.is_empty());
        assert!(!outcome.iteration_limit_reached);
        assert_eq!(outcome.status, ExecutionStatus::Responding);
        assert_eq!(outcome.token_usage, USAGE_PER_CALL);
        assert_eq!(
            f.store.history(&outcome.execution_id).unwrap(),
            vec![ExecutionStatus::Idle, ExecutionStatus::Thinking, ExecutionStatus::Responding]
        );
        let record = f.store.get(&outcome.execution_id).await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn request_carries_agent_settings_and_full_tool_catalog() {
        let f = fixture(vec![text("ok")]);
        f.orchestrator.execute_agent(request("s1", "hi")).await.unwrap();

        let sent = &f.provider.requests()[0];
        assert_eq!(sent.model, "test-model");
        assert_eq!(sent.max_tokens, Some(256));
        assert!(sent.system_prompt.starts_with("You solve arithmetic."));
        // Every registered tool is offered, regardless of the agent.
        let names: Vec<_> = sent.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calculator", "current_time", "text_summary"]);
        assert!(sent.system_prompt.contains("- calculator: "));
    }

    #[tokio::test]
    async fn tool_rounds_feed_back_into_history() {
        let f = fixture(vec![calc("2+2"), calc("4*3"), text("The answer is 12.")]);
        let outcome = f.orchestrator.execute_agent(request("s1", "compute")).await.unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.tools_used, vec!["calculator", "calculator"]);
        assert_eq!(outcome.token_usage, TokenUsage::new(30, 15));

        let last = f.provider.requests().pop().unwrap();
        assert_eq!(last.messages.len(), 5);
        assert_eq!(last.messages[1].role, Role::Assistant);
        assert!(last.messages[1].content.starts_with("Using tool calculator with params:"));
        assert_eq!(last.messages[4].role, Role::System);
        assert!(last.messages[4].content.starts_with("Tool result: "));
        assert!(last.messages[4].content.contains("12"));

        assert_eq!(
            f.store.history(&outcome.execution_id).unwrap(),
            vec![
                ExecutionStatus::Idle,
                ExecutionStatus::Thinking,
                ExecutionStatus::UsingTool,
                ExecutionStatus::Thinking,
                ExecutionStatus::UsingTool,
                ExecutionStatus::Thinking,
                ExecutionStatus::Responding,
            ]
        );
    }

    #[tokio::test]
    async fn failed_tool_does_not_end_the_loop() {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(FailingTool { name: "flaky", message: "boom" }));
        let f = fixture_with(
            vec![tool("flaky", json!({})), text("Sorry, that failed.")],
            tools,
            OrchestratorSettings::default(),
        );
        let outcome = f.orchestrator.execute_agent(request("s1", "try")).await.unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tools_used, vec!["flaky"]);
        let last = f.provider.requests().pop().unwrap();
        assert_eq!(last.messages.last().unwrap().content, "Tool execution failed: boom");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_result() {
        let f = fixture(vec![tool("web_search", json!({"q": "rust"})), text("No search available.")]);
        let outcome = f.orchestrator.execute_agent(request("s1", "search")).await.unwrap();
        assert_eq!(outcome.tools_used, vec!["web_search"]);
        let last = f.provider.requests().pop().unwrap();
        assert_eq!(last.messages.last().unwrap().content, "Tool execution failed: Tool 'web_search' not found");
    }

    #[tokio::test]
    async fn llm_failure_marks_record_error() {
        let f = fixture(vec![
            calc("1+1"),
            Script::Fail(ProviderError::ApiError { status_code: 500, message: "down".into() }),
        ]);
        let err = f.orchestrator.execute_agent(request("s1", "hi")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::ApiError { status_code: 500, .. })));

        let records = f.store.find_by_session("s1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Error);
        assert!(records[0].end_time.is_some());
    }

    #[tokio::test]
    async fn unknown_agent_fails_before_the_loop() {
        let f = fixture(vec![text("unused")]);
        let err = f
            .orchestrator
            .execute_agent(ExecutionRequest::new("ghost", "s1", "u", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotFound(ref id) if id == "ghost"));
        assert_eq!(f.provider.call_count(), 0);

        let record = &f.store.find_by_session("s1").await.unwrap()[0];
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(f.store.history(&record.id).unwrap(), vec![ExecutionStatus::Idle, ExecutionStatus::Error]);
    }

    #[tokio::test]
    async fn iteration_limit_truncates_with_flag() {
        let settings = OrchestratorSettings { max_iterations: 3, ..Default::default() };
        let mut script = Vec::new();
        for _ in 0..5 {
            script.push(Script::Reply(LlmTurn::ToolRequest(agentrelay_core::provider::ToolRequest {
                tool_name: "calculator".into(),
                tool_params: json!({"expression": "1+1"}),
                reasoning: Some("Still working".into()),
            })));
        }
        let f = fixture_with(script, default_registry(), settings);
        let outcome = f.orchestrator.execute_agent(request("s1", "loop")).await.unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(f.provider.call_count(), 3);
        assert!(outcome.iteration_limit_reached);
        assert_eq!(outcome.response, "Still working");
        let history = f.store.history(&outcome.execution_id).unwrap();
        assert_eq!(&history[history.len() - 2..], &[ExecutionStatus::Thinking, ExecutionStatus::Responding]);
    }

    #[tokio::test]
    async fn context_is_windowed() {
        let f = fixture(vec![text("ok")]);
        let prior: Vec<_> = (0..15).map(|i| Message::user(format!("turn {i}"))).collect();
        f.orchestrator
            .execute_agent(request("s1", "latest").with_context(prior))
            .await
            .unwrap();

        let sent = &f.provider.requests()[0];
        assert_eq!(sent.messages.len(), 11);
        assert_eq!(sent.messages[0].content, "turn 5");
        assert_eq!(sent.messages[10].content, "latest");
    }

    #[tokio::test]
    async fn memory_recall_and_auto_save() {
        let settings = OrchestratorSettings { auto_save_memory: true, ..Default::default() };
        let f = fixture_with(vec![text("Noted, metric it is.")], default_registry(), settings);
        f.memory.remember("s1", "The user prefers metric units").await.unwrap();
        f.memory.remember("other", "The user prefers imperial units").await.unwrap();

        f.orchestrator
            .execute_agent(request("s1", "Which units does the user prefer?"))
            .await
            .unwrap();

        let prompt = &f.provider.requests()[0].system_prompt;
        assert!(prompt.contains("Relevant past context:\n- The user prefers metric units"));
        assert!(!prompt.contains("imperial"));
        assert_eq!(f.memory.count("s1").await, 2);
    }

    #[tokio::test]
    async fn busy_session_is_rejected() {
        let f = fixture(vec![Script::Stall]);
        f.orchestrator.execute_agent_streaming(request("s1", "first")).await.unwrap();
        let err = f.orchestrator.execute_agent(request("s1", "second")).await.unwrap_err();
        assert!(matches!(err, Error::Execution(ExecutionError::SessionBusy { .. })));
        f.orchestrator.cancel_streaming_execution("s1");
        f.orchestrator.await_stream("s1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn llm_timeout_is_fatal() {
        let settings = OrchestratorSettings {
            llm_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let f = fixture_with(vec![Script::Stall], default_registry(), settings);
        let err = f.orchestrator.execute_agent(request("s1", "hi")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::Timeout(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_is_not_fatal() {
        let tools = {
            let mut tools = ToolRegistry::new().with_timeout(Duration::from_secs(1));
            tools.register(Box::new(SlowTool { delay: Duration::from_secs(30) }));
            tools
        };
        let f = fixture_with(
            vec![tool("slow", json!({})), text("Gave up on the slow tool.")],
            tools,
            OrchestratorSettings::default(),
        );
        let outcome = f.orchestrator.execute_agent(request("s1", "go")).await.unwrap();
        assert_eq!(outcome.response, "Gave up on the slow tool.");
        let last = f.provider.requests().pop().unwrap();
        assert!(last.messages.last().unwrap().content.starts_with("Tool execution failed: "));
    }

    // ── Streaming ──

    #[tokio::test]
    async fn streaming_text_answer() {
        let f = fixture(vec![text("Hello from the stream")]);
        let handle = f.orchestrator.execute_agent_streaming(request("s1", "hi")).await.unwrap();
        assert_eq!(handle.status, StreamState::Streaming);
        f.orchestrator.await_stream("s1").await;

        assert_eq!(
            f.sink.kinds("s1"),
            vec!["stream_start", "stream_chunk", "stream_chunk", "stream_chunk", "stream_chunk", "stream_complete"]
        );
        let events = f.sink.for_session("s1");
        assert!(events.iter().all(|e| e.execution_id == handle.execution_id));
        match &events.last().unwrap().payload {
            StreamPayload::Complete { final_response, tools_used, token_usage, .. } => {
                assert_eq!(final_response, "Hello from the stream");
                assert!(tools_used.is_empty());
                assert_eq!(*token_usage, USAGE_PER_CALL);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let record = f.store.get(&handle.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Responding);
        assert!(!f.orchestrator.get_streaming_status("s1").is_active);
    }

    #[tokio::test]
    async fn streaming_tool_rounds_are_paired() {
        let f = fixture(vec![calc("2+2"), calc("4*3"), text("Done")]);
        f.orchestrator.execute_agent_streaming(request("s1", "compute")).await.unwrap();
        f.orchestrator.await_stream("s1").await;

        let kinds: Vec<_> = f
            .sink
            .kinds("s1")
            .into_iter()
            .filter(|k| *k != "stream_chunk")
            .collect();
        assert_eq!(
            kinds,
            vec![
                "stream_start",
                "stream_tool_call",
                "stream_tool_result",
                "stream_tool_call",
                "stream_tool_result",
                "stream_complete",
            ]
        );
        let session = f.orchestrator.get_streaming_status("s1").session.unwrap();
        assert_eq!(session.tools_used, vec!["calculator", "calculator"]);
    }

    #[tokio::test]
    async fn streaming_failed_tool_reports_success_false() {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(FailingTool { name: "flaky", message: "boom" }));
        let f = fixture_with(
            vec![tool("flaky", json!({})), text("Recovered")],
            tools,
            OrchestratorSettings::default(),
        );
        f.orchestrator.execute_agent_streaming(request("s1", "try")).await.unwrap();
        f.orchestrator.await_stream("s1").await;

        let result = f
            .sink
            .for_session("s1")
            .into_iter()
            .find(|e| e.kind() == "stream_tool_result")
            .unwrap();
        assert!(matches!(
            result.payload,
            StreamPayload::ToolResult { success: false, ref error, .. } if error.as_deref() == Some("boom")
        ));
        assert_eq!(f.sink.kinds("s1").last(), Some(&"stream_complete"));
    }

    #[tokio::test]
    async fn streaming_llm_failure_emits_one_error() {
        let f = fixture(vec![
            calc("1+1"),
            Script::Fail(ProviderError::Network("connection reset".into())),
        ]);
        let handle = f.orchestrator.execute_agent_streaming(request("s1", "hi")).await.unwrap();
        f.orchestrator.await_stream("s1").await;

        let kinds = f.sink.kinds("s1");
        assert_eq!(kinds.iter().filter(|k| **k == "stream_error").count(), 1);
        assert!(!kinds.contains(&"stream_complete"));
        match &f.sink.for_session("s1").last().unwrap().payload {
            StreamPayload::Error { error, code, .. } => {
                assert!(error.contains("connection reset"));
                assert_eq!(code.as_deref(), Some(codes::EXECUTION_ERROR));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let record = f.store.get(&handle.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn streaming_unknown_agent_is_a_startup_error() {
        let f = fixture(vec![]);
        let handle = f
            .orchestrator
            .execute_agent_streaming(ExecutionRequest::new("ghost", "s1", "u", "hi"))
            .await
            .unwrap();

        assert_eq!(handle.status, StreamState::Error);
        assert_eq!(f.sink.kinds("s1"), vec!["stream_start", "stream_error"]);
        match &f.sink.for_session("s1")[1].payload {
            StreamPayload::Error { code, .. } => assert_eq!(code.as_deref(), Some(codes::STARTUP_ERROR)),
            other => panic!("unexpected payload {other:?}"),
        }
        let record = f.store.get(&handle.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn cancel_stops_a_stalled_stream() {
        let f = fixture(vec![Script::Stall]);
        let handle = f.orchestrator.execute_agent_streaming(request("s1", "hi")).await.unwrap();
        tokio::task::yield_now().await;

        assert!(f.orchestrator.cancel_streaming_execution("s1"));
        f.orchestrator.await_stream("s1").await;

        assert_eq!(f.sink.kinds("s1"), vec!["stream_start", "stream_error"]);
        match &f.sink.for_session("s1")[1].payload {
            StreamPayload::Error { error, code, .. } => {
                assert_eq!(error, CANCELLED_MESSAGE);
                assert_eq!(code.as_deref(), Some(codes::CANCELLED));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let record = f.store.get(&handle.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);

        // The session is free again; the script is exhausted, so the new
        // execution fails inside the loop rather than as busy.
        let err = f.orchestrator.execute_agent(request("s1", "again")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_a_noop() {
        let f = fixture(vec![]);
        assert!(!f.orchestrator.cancel_streaming_execution("nope"));
        let status = f.orchestrator.get_streaming_status("nope");
        assert!(!status.is_active);
        assert!(status.session.is_none());
    }

    /// Memory whose `remember` parks until released.
    #[derive(Default)]
    struct GatedMemory {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl MemorySearch for GatedMemory {
        fn name(&self) -> &str {
            "gated"
        }
        async fn search(
            &self,
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<Vec<agentrelay_core::memory::MemorySnippet>, agentrelay_core::error::MemoryError> {
            Ok(vec![])
        }
        async fn remember(&self, _: &str, _: &str) -> Result<(), agentrelay_core::error::MemoryError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stream_completes_before_memory_auto_save() {
        let memory = Arc::new(GatedMemory::default());
        let store = Arc::new(InMemoryExecutionStore::new());
        let sink = Arc::new(RecordingSink::new());
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedProvider::new(vec![text("Saved")])),
            Arc::new(StaticAgentDirectory::new([profile()])),
            Arc::new(default_registry()),
            store.clone(),
            memory.clone(),
            Arc::new(StreamRegistry::new(sink.clone())),
        )
        .with_settings(OrchestratorSettings { auto_save_memory: true, ..Default::default() });

        let handle = orchestrator.execute_agent_streaming(request("s1", "remember this")).await.unwrap();
        memory.entered.notified().await;

        // The stream has already completed, so a cancel now changes nothing.
        assert_eq!(sink.kinds("s1").last(), Some(&"stream_complete"));
        orchestrator.cancel_streaming_execution("s1");
        memory.release.notify_one();
        orchestrator.await_stream("s1").await;

        assert!(!sink.kinds("s1").contains(&"stream_error"));
        let record = store.get(&handle.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Responding);
        assert!(record.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_delay_option_paces_deltas() {
        let f = fixture(vec![text("one two three")]);
        let started = tokio::time::Instant::now();
        f.orchestrator
            .execute_agent_streaming(request("s1", "hi").with_chunk_delay(100))
            .await
            .unwrap();
        f.orchestrator.await_stream("s1").await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
