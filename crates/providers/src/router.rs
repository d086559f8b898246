//! Provider selection from configuration.

use std::sync::Arc;

use agentrelay_config::AppConfig;
use agentrelay_core::error::ProviderError;
use agentrelay_core::provider::LlmProvider;
use tracing::info;

use crate::openai_compat::OpenAiCompatProvider;

/// Build the configured default provider.
///
/// The per-provider table may override the API key, base URL and tool mode;
/// well-known providers get their public base URL otherwise.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let name = config.default_provider.as_str();
    let provider_config = config.providers.get(name);

    let base_url = provider_config
        .and_then(|p| p.api_url.clone())
        .or_else(|| default_base_url(name).map(String::from))
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "provider '{name}' has no api_url and no known default"
            ))
        })?;

    let api_key = provider_config
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.api_key.clone())
        .unwrap_or_default();

    let tool_mode = provider_config.map(|p| p.tool_mode).unwrap_or_default();

    info!(provider = %name, base_url = %base_url, ?tool_mode, "LLM provider configured");

    Ok(Arc::new(
        OpenAiCompatProvider::new(name, base_url, api_key).with_tool_mode(tool_mode),
    ))
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> Option<&'static str> {
    Some(match provider_name {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "vllm" => "http://localhost:8000/v1",
        _ => return None,
    })
}
