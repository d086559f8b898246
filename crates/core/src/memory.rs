//! Memory search: best-effort retrieval of related snippets for a session.
//!
//! Failures here are never fatal to an execution; callers log and continue
//! without the extra context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// A ranked text snippet returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub content: String,

    /// Relevance score (higher is better)
    #[serde(default)]
    pub score: f32,
}

/// The memory collaborator consumed by the reasoning loop.
///
/// Implementations: in-memory keyword search, none (no-op).
#[async_trait]
pub trait MemorySearch: Send + Sync {
    /// The backend name (e.g., "in_memory", "none").
    fn name(&self) -> &str;

    /// Top `top_k` snippets for `query` within `session_id`, best first.
    async fn search(
        &self,
        session_id: &str,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<MemorySnippet>, MemoryError>;

    /// Store a piece of text for later retrieval within `session_id`.
    async fn remember(&self, session_id: &str, content: &str) -> std::result::Result<(), MemoryError>;
}
