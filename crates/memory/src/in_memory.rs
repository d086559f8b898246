//! In-memory keyword search: useful for testing and ephemeral deployments.
//!
//! Memories are partitioned by session. A snippet's score is the fraction of
//! distinct query terms it contains; newer snippets win ties.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agentrelay_core::error::MemoryError;
use agentrelay_core::memory::{MemorySearch, MemorySnippet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMemory {
    content: String,
    terms: HashSet<String>,
    stored_at: DateTime<Utc>,
}

/// Session-keyed memories held in a map.
pub struct InMemorySearch {
    sessions: Arc<RwLock<HashMap<String, Vec<StoredMemory>>>>,
}

impl InMemorySearch {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of memories stored for a session.
    pub async fn count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

impl Default for InMemorySearch {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased alphanumeric words of at least three characters.
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemorySearch for InMemorySearch {
    fn name(&self) -> &str { "in_memory" }

    async fn search(&self, session_id: &str, query: &str, top_k: usize) -> Result<Vec<MemorySnippet>, MemoryError> {
        let query_terms = terms(query);
        if query_terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let sessions = self.sessions.read().await;
        let Some(memories) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };

        let mut ranked: Vec<(f32, DateTime<Utc>, &StoredMemory)> = memories
            .iter()
            .filter_map(|m| {
                let hits = query_terms.intersection(&m.terms).count();
                (hits > 0).then(|| (hits as f32 / query_terms.len() as f32, m.stored_at, m))
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        ranked.truncate(top_k);

        debug!(session_id = %session_id, hits = ranked.len(), "Memory search finished");

        Ok(ranked
            .into_iter()
            .map(|(score, _, m)| MemorySnippet {
                content: m.content.clone(),
                score,
            })
            .collect())
    }

    async fn remember(&self, session_id: &str, content: &str) -> Result<(), MemoryError> {
        if content.trim().is_empty() {
            return Err(MemoryError::Storage("refusing to store empty memory".into()));
        }
        let memory = StoredMemory {
            content: content.to_string(),
            terms: terms(content),
            stored_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(memory);
        Ok(())
    }
}
