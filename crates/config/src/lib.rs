//! Configuration loading, validation, and management for agentrelay.
//!
//! Loads configuration from `~/.agentrelay/config.toml` (or
//! `$AGENTRELAY_HOME/config.toml`) with environment variable overrides.
//! Validates all settings at startup.

use agentrelay_core::AgentProfile;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.agentrelay/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Reasoning loop bounds
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Streaming session retention and throttling
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Subscriber fan-out
    #[serde(default)]
    pub relay: RelayConfig,

    /// Plain chat worker
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Agents served by this process
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentEntry>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("orchestrator", &self.orchestrator)
            .field("streaming", &self.streaming)
            .field("relay", &self.relay)
            .field("worker", &self.worker)
            .field("memory", &self.memory)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .field("agents", &self.agents)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("tool_mode", &self.tool_mode)
            .finish()
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Prior turns kept in front of the new user message
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,

    /// 0 disables the timeout
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,

    /// 0 disables the timeout
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Store each successful exchange into the session's memory
    #[serde(default)]
    pub auto_save_memory: bool,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_context_window() -> usize {
    10
}
fn default_memory_top_k() -> usize {
    5
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_tool_timeout() -> u64 {
    30
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl OrchestratorConfig {
    pub fn llm_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.llm_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.tool_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            context_window: default_context_window(),
            memory_top_k: default_memory_top_k(),
            llm_timeout_secs: default_llm_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            auto_save_memory: false,
        }
    }
}

// ── Streaming / relay / worker ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Pause between emitted text deltas
    #[serde(default)]
    pub chunk_delay_ms: u64,

    /// How long a completed session stays queryable
    #[serde(default = "default_complete_retention")]
    pub complete_retention_ms: u64,

    /// How long an errored or cancelled session stays queryable
    #[serde(default = "default_error_retention")]
    pub error_retention_ms: u64,
}

fn default_complete_retention() -> u64 {
    5_000
}
fn default_error_retention() -> u64 {
    1_000
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_delay_ms: 0,
            complete_retention_ms: default_complete_retention(),
            error_retention_ms: default_error_retention(),
        }
    }
}

/// Where stream events travel between the producing loop and the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayBackend {
    /// Straight into this process's relay
    #[default]
    InProcess,
    /// Through Redis pub/sub on `stream:{sessionId}` channels
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Subscriber bookkeeping kept after `stream_complete`
    #[serde(default = "default_complete_grace")]
    pub complete_grace_ms: u64,

    #[serde(default)]
    pub backend: RelayBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_complete_grace() -> u64 {
    5_000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            complete_grace_ms: default_complete_grace(),
            backend: RelayBackend::InProcess,
            redis_url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_words_per_chunk")]
    pub words_per_chunk: usize,

    #[serde(default = "default_worker_chunk_delay")]
    pub chunk_delay_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_words_per_chunk() -> usize {
    5
}
fn default_worker_chunk_delay() -> u64 {
    50
}
fn default_queue_capacity() -> usize {
    256
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            words_per_chunk: default_words_per_chunk(),
            chunk_delay_ms: default_worker_chunk_delay(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

// ── Memory / gateway / providers / agents ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "in_memory" or "none"
    #[serde(default = "default_memory_backend")]
    pub backend: String,
}

fn default_memory_backend() -> String {
    "in_memory".into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42719
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// How a provider is told about tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// OpenAI-style `tools` / `tool_calls`
    #[default]
    Native,
    /// Tool intent as a JSON object in the reply text
    Prompt,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default)]
    pub tool_mode: ToolMode,
}

/// An agent declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Falls back to `default_model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl AppConfig {
    /// Load configuration from the default path.
    ///
    /// Environment overrides:
    /// - `AGENTRELAY_API_KEY`, then `OPENAI_API_KEY` (when no key is configured)
    /// - `AGENTRELAY_PROVIDER`, `AGENTRELAY_MODEL`, `AGENTRELAY_PORT`
    /// - `AGENTRELAY_REDIS_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("AGENTRELAY_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("AGENTRELAY_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("AGENTRELAY_MODEL") {
            self.default_model = model;
        }

        if let Ok(url) = std::env::var("AGENTRELAY_REDIS_URL") {
            self.relay.redis_url = url;
        }

        if let Some(port) = std::env::var("AGENTRELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.gateway.port = port;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        std::env::var("AGENTRELAY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs_home().join(".agentrelay"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.orchestrator.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_iterations must be at least 1".into(),
            ));
        }

        if self.orchestrator.context_window == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.context_window must be at least 1".into(),
            ));
        }

        if self.worker.words_per_chunk == 0 {
            return Err(ConfigError::ValidationError(
                "worker.words_per_chunk must be at least 1".into(),
            ));
        }

        if self.relay.backend == RelayBackend::Redis
            && !(self.relay.redis_url.starts_with("redis://") || self.relay.redis_url.starts_with("rediss://"))
        {
            return Err(ConfigError::ValidationError(
                "relay.redis_url must start with redis:// or rediss://".into(),
            ));
        }

        if self.gateway.port == 0 {
            return Err(ConfigError::ValidationError("gateway.port must not be 0".into()));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            if let Some(t) = agent.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::ValidationError(format!(
                        "agent '{}' temperature must be between 0.0 and 2.0",
                        agent.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Resolve configured agents into profiles, filling in the defaults.
    pub fn agent_profiles(&self) -> Vec<AgentProfile> {
        self.agents
            .iter()
            .map(|a| AgentProfile {
                id: a.id.clone(),
                name: if a.name.is_empty() { a.id.clone() } else { a.name.clone() },
                system_prompt: a.system_prompt.clone(),
                model_id: a.model_id.clone().unwrap_or_else(|| self.default_model.clone()),
                temperature: a.temperature.unwrap_or(self.default_temperature),
                max_tokens: a.max_tokens.or(Some(self.default_max_tokens)),
            })
            .collect()
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            orchestrator: OrchestratorConfig::default(),
            streaming: StreamingConfig::default(),
            relay: RelayConfig::default(),
            worker: WorkerConfig::default(),
            memory: MemoryConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
            agents: Vec::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
