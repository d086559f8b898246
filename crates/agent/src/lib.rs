//! The agentrelay reasoning loop and the pieces around it.
//!
//! [`Orchestrator`] drives one execution at a time per session:
//!
//! 1. **Resolve** the agent profile
//! 2. **Assemble** the prompt (agent prompt, tool catalog, recalled memory)
//!    and a bounded conversation window
//! 3. **Think**: call the LLM, which answers with text or one tool request
//! 4. **Act**: run the requested tool, feed the result back, think again
//! 5. **Respond** once the model answers in plain text
//!
//! Blocking callers get an [`ExecutionOutcome`]; streaming callers get a
//! [`StreamingHandle`] and follow the execution through stream events.

pub mod context;
pub mod directory;
pub mod orchestrator;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_helpers;

pub use directory::StaticAgentDirectory;
pub use orchestrator::{
    ExecutionOutcome, ExecutionRequest, Orchestrator, OrchestratorSettings, StreamState,
    StreamingHandle, StreamingOptions,
};
pub use store::InMemoryExecutionStore;
pub use worker::{ChatJob, ChatWorker, JobQueue, QueueError, WorkerSettings, word_groups};
