//! No-op memory backend: disables memory context entirely.

use agentrelay_core::error::MemoryError;
use agentrelay_core::memory::{MemorySearch, MemorySnippet};
use async_trait::async_trait;

/// A no-op memory backend that stores nothing and finds nothing.
pub struct NoopMemory;

#[async_trait]
impl MemorySearch for NoopMemory {
    fn name(&self) -> &str { "none" }

    async fn search(&self, _session_id: &str, _query: &str, _top_k: usize) -> Result<Vec<MemorySnippet>, MemoryError> {
        Ok(Vec::new())
    }

    async fn remember(&self, _session_id: &str, _content: &str) -> Result<(), MemoryError> {
        Ok(())
    }
}
