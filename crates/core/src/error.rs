//! Error types for the agentrelay domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

use crate::execution::ExecutionStatus;

/// The top-level error type for all agentrelay operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Agent lookup ---
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // --- LLM invocation ---
    #[error("LLM invocation failed: {0}")]
    Provider(#[from] ProviderError),

    // --- Execution bookkeeping ---
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Cooperative cancellation ---
    #[error("Execution cancelled for session {session_id}")]
    Cancelled { session_id: String },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool '{tool_name}' timed out after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Execution record not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition {from} -> {to} for execution {id}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Session {session_id} already has an active execution ({execution_id})")]
    SessionBusy {
        session_id: String,
        execution_id: String,
    },

    #[error("Execution store unavailable: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_not_found_matches_gateway_wording() {
        let err = ToolError::NotFound("weather".into());
        assert_eq!(err.to_string(), "Tool 'weather' not found");
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = ExecutionError::InvalidTransition {
            id: "exec_1".into(),
            from: ExecutionStatus::Responding,
            to: ExecutionStatus::Thinking,
        };
        let text = err.to_string();
        assert!(text.contains("responding"));
        assert!(text.contains("thinking"));
    }
}
