//! LLM provider implementations for agentrelay.
//!
//! All providers implement `agentrelay_core::LlmProvider` and return a
//! decoded `LlmTurn`, never raw text for the loop to inspect.

pub mod decode;
pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::build_from_config;
