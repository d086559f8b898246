//! Provider doubles and config for gateway tests.

use agentrelay_config::{AgentEntry, AppConfig};
use agentrelay_core::{LlmCompletion, LlmProvider, LlmRequest, LlmTurn, ProviderError, TokenUsage};

/// Answers every request with the same text.
pub struct FixedProvider {
    response_text: String,
}

impl FixedProvider {
    pub fn new(text: &str) -> Self {
        Self {
            response_text: text.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for FixedProvider {
    fn name(&self) -> &str {
        "gateway_fixed"
    }

    async fn complete(&self, _request: LlmRequest) -> Result<LlmCompletion, ProviderError> {
        Ok(LlmCompletion {
            turn: LlmTurn::text(&self.response_text),
            usage: TokenUsage::new(10, 5),
        })
    }
}

/// Always fails like an unreachable backend.
pub struct DownProvider;

#[async_trait::async_trait]
impl LlmProvider for DownProvider {
    fn name(&self) -> &str {
        "gateway_down"
    }

    async fn complete(&self, _request: LlmRequest) -> Result<LlmCompletion, ProviderError> {
        Err(ProviderError::Network("connection refused".into()))
    }
}

/// Never answers; keeps a streaming execution active.
pub struct StallingProvider;

#[async_trait::async_trait]
impl LlmProvider for StallingProvider {
    fn name(&self) -> &str {
        "gateway_stalling"
    }

    async fn complete(&self, _request: LlmRequest) -> Result<LlmCompletion, ProviderError> {
        std::future::pending().await
    }
}

/// Defaults plus one `helper` agent and no artificial delays.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.memory.backend = "none".into();
    config.worker.chunk_delay_ms = 0;
    config.streaming.chunk_delay_ms = 0;
    config.agents.push(AgentEntry {
        id: "helper".into(),
        name: "Helper".into(),
        system_prompt: Some("You help.".into()),
        model_id: Some("test-model".into()),
        temperature: None,
        max_tokens: None,
    });
    config
}
