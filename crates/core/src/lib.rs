//! # agentrelay core
//!
//! Domain types, collaborator traits and error definitions for the
//! agentrelay execution runtime. Every external collaborator of the
//! reasoning loop (LLM, tools, memory, agent lookup, execution persistence)
//! is a trait here; implementations live in their own crates and tests swap
//! in scripted doubles.

pub mod agent;
pub mod error;
pub mod execution;
pub mod memory;
pub mod message;
pub mod provider;
pub mod stream_event;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentDirectory, AgentProfile};
pub use error::{Error, ExecutionError, MemoryError, ProviderError, Result, ToolError};
pub use execution::{ExecutionRecord, ExecutionStatus, ExecutionStore, StatusUpdate, TokenUsage};
pub use memory::{MemorySearch, MemorySnippet};
pub use message::{Message, Role, context_window};
pub use provider::{
    LlmCompletion, LlmProvider, LlmRequest, LlmTurn, PieceStream, StreamPiece, ToolDefinition,
    ToolRequest,
};
pub use stream_event::{StreamEvent, StreamPayload};
pub use tool::{Tool, ToolRegistry, ToolResult};
