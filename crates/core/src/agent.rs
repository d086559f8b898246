//! Agent profiles and the lookup contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the reasoning loop needs to know about an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Agent instructions; a generic assistant prompt is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    pub model_id: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// Agent lookup. `None` means the agent does not exist.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Option<AgentProfile>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_deserializes_with_defaults() {
        let profile: AgentProfile =
            serde_json::from_str(r#"{"id":"a1","modelId":"gpt-4o-mini"}"#).unwrap();
        assert!((profile.temperature - 0.7).abs() < f32::EPSILON);
        assert!(profile.system_prompt.is_none());
        assert!(profile.max_tokens.is_none());
    }
}
