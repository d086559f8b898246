//! In-process execution record store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use agentrelay_core::error::ExecutionError;
use agentrelay_core::execution::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, StatusUpdate, TokenUsage,
};
use async_trait::async_trait;
use tracing::debug;

struct StoredExecution {
    seq: u64,
    record: ExecutionRecord,
    /// Every status the record has been in, in order
    statuses: Vec<ExecutionStatus>,
}

#[derive(Default)]
struct StoreState {
    next_seq: u64,
    executions: HashMap<String, StoredExecution>,
}

impl StoreState {
    fn entry(&mut self, id: &str) -> Result<&mut StoredExecution, ExecutionError> {
        self.executions
            .get_mut(id)
            .ok_or_else(|| ExecutionError::NotFound(id.to_string()))
    }
}

/// Keeps every execution record in memory. A session may hold at most one
/// active record at a time.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    state: Mutex<StoreState>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The status sequence a record went through, starting with `idle`.
    pub fn history(&self, id: &str) -> Option<Vec<ExecutionStatus>> {
        self.state().executions.get(id).map(|e| e.statuses.clone())
    }

    pub fn len(&self) -> usize {
        self.state().executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, agent_id: &str, session_id: &str) -> Result<ExecutionRecord, ExecutionError> {
        let mut state = self.state();
        if let Some(active) = state
            .executions
            .values()
            .find(|e| e.record.session_id == session_id && e.record.is_active())
        {
            return Err(ExecutionError::SessionBusy {
                session_id: session_id.to_string(),
                execution_id: active.record.id.clone(),
            });
        }

        let record = ExecutionRecord::new(agent_id, session_id);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.executions.insert(
            record.id.clone(),
            StoredExecution {
                seq,
                record: record.clone(),
                statuses: vec![record.status],
            },
        );
        debug!(execution_id = %record.id, session_id = %session_id, "Execution record created");
        Ok(record)
    }

    async fn update_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let mut state = self.state();
        let entry = state.entry(id)?;
        entry.record.transition(status, update)?;
        entry.statuses.push(status);
        Ok(entry.record.clone())
    }

    async fn finish(&self, id: &str, usage: TokenUsage) -> Result<ExecutionRecord, ExecutionError> {
        let mut state = self.state();
        let entry = state.entry(id)?;
        entry.record.finish(usage)?;
        Ok(entry.record.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, ExecutionError> {
        Ok(self.state().executions.get(id).map(|e| e.record.clone()))
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Vec<ExecutionRecord>, ExecutionError> {
        let state = self.state();
        let mut found: Vec<_> = state
            .executions
            .values()
            .filter(|e| e.record.session_id == session_id)
            .collect();
        found.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(found.into_iter().map(|e| e.record.clone()).collect())
    }
}
