//! Agent lookup backed by a fixed set of profiles.

use std::collections::HashMap;
use std::sync::RwLock;

use agentrelay_config::AppConfig;
use agentrelay_core::agent::{AgentDirectory, AgentProfile};
use async_trait::async_trait;

#[derive(Default)]
pub struct StaticAgentDirectory {
    agents: RwLock<HashMap<String, AgentProfile>>,
}

impl StaticAgentDirectory {
    pub fn new(profiles: impl IntoIterator<Item = AgentProfile>) -> Self {
        let agents = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            agents: RwLock::new(agents),
        }
    }

    /// Profiles from the `[[agents]]` config section.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.agent_profiles())
    }

    /// Add or replace a profile.
    pub fn insert(&self, profile: AgentProfile) {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(profile.id.clone(), profile);
    }

    /// All profiles, sorted by id.
    pub fn list(&self) -> Vec<AgentProfile> {
        let mut profiles: Vec<_> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn get_agent(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_config::AgentEntry;

    #[tokio::test]
    async fn resolves_configured_agents() {
        let mut config = AppConfig::default();
        config.agents.push(AgentEntry {
            id: "math".into(),
            name: "Math helper".into(),
            system_prompt: Some("You do arithmetic.".into()),
            model_id: None,
            temperature: Some(0.2),
            max_tokens: None,
        });

        let directory = StaticAgentDirectory::from_config(&config);
        let agent = directory.get_agent("math").await.unwrap();
        assert_eq!(agent.model_id, config.default_model);
        assert_eq!(agent.temperature, 0.2);
        assert!(directory.get_agent("missing").await.is_none());
    }

    #[tokio::test]
    async fn insert_replaces_profile() {
        let directory = StaticAgentDirectory::default();
        let mut profile = AgentProfile {
            id: "a".into(),
            name: "A".into(),
            system_prompt: None,
            model_id: "m1".into(),
            temperature: 0.7,
            max_tokens: None,
        };
        directory.insert(profile.clone());
        profile.model_id = "m2".into();
        directory.insert(profile);

        assert_eq!(directory.list().len(), 1);
        assert_eq!(directory.get_agent("a").await.unwrap().model_id, "m2");
    }
}
