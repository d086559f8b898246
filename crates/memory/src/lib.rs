//! Memory search implementations for agentrelay.

pub mod in_memory;
pub mod noop;

use std::sync::Arc;

use agentrelay_core::memory::MemorySearch;

pub use in_memory::InMemorySearch;
pub use noop::NoopMemory;

/// Build the backend named in `[memory] backend`. Unknown names fall back to
/// the no-op backend.
pub fn from_backend_name(name: &str) -> Arc<dyn MemorySearch> {
    match name {
        "in_memory" | "memory" => Arc::new(InMemorySearch::new()),
        "none" => Arc::new(NoopMemory),
        other => {
            tracing::warn!(backend = %other, "Unknown memory backend, memory context disabled");
            Arc::new(NoopMemory)
        }
    }
}
