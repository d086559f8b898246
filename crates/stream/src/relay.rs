//! Fan-out of stream events to connected subscribers.
//!
//! Connections register once and receive events through an unbounded
//! channel. A connection subscribes to a session (optionally pinned to one
//! execution) and from then on gets every event published for it. There is
//! no replay: events published before the subscription are not delivered.
//!
//! After `stream_complete` a session's subscribers are kept for a grace
//! period so late readers can drain, then dropped. After `stream_error`
//! they are dropped at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agentrelay_core::stream_event::{StreamEvent, StreamPayload};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::sink::EventSink;

pub type ConnectionId = String;

#[derive(Default)]
struct SessionSubscribers {
    /// connection -> optional execution filter
    subscribers: HashMap<ConnectionId, Option<String>>,
    /// Execution whose `stream_complete` was seen and not yet superseded.
    closed_execution: Option<String>,
}

#[derive(Default)]
struct RelayState {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<StreamEvent>>,
    sessions: HashMap<String, SessionSubscribers>,
}

impl RelayState {
    fn drop_connection(&mut self, connection_id: &str) {
        self.connections.remove(connection_id);
        self.sessions.retain(|_, entry| {
            entry.subscribers.remove(connection_id);
            !entry.subscribers.is_empty()
        });
    }
}

#[derive(Clone)]
pub struct EventRelay {
    state: Arc<Mutex<RelayState>>,
    grace: Duration,
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            grace: Duration::from_secs(5),
        }
    }

    /// How long subscribers stay attached after `stream_complete`.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new connection.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4().to_string();
        self.state().connections.insert(connection_id.clone(), tx);
        debug!(connection_id = %connection_id, "Relay connection opened");
        (connection_id, rx)
    }

    /// Forget a connection and all of its subscriptions.
    pub fn disconnect(&self, connection_id: &str) {
        self.state().drop_connection(connection_id);
        debug!(connection_id = %connection_id, "Relay connection closed");
    }

    /// Subscribe a connection to a session. With `execution_id` set only
    /// that execution's events are forwarded. Returns `false` for an
    /// unknown connection.
    pub fn subscribe(&self, connection_id: &str, session_id: &str, execution_id: Option<&str>) -> bool {
        let mut state = self.state();
        if !state.connections.contains_key(connection_id) {
            return false;
        }
        state
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .subscribers
            .insert(connection_id.to_string(), execution_id.map(String::from));
        info!(connection_id = %connection_id, session_id = %session_id, execution_id = ?execution_id, "Subscribed to stream");
        true
    }

    /// Remove a connection's subscription to a session. With
    /// `execution_id` set, only a subscription pinned to that execution is
    /// removed. Returns `true` when a subscription was removed.
    pub fn unsubscribe(&self, connection_id: &str, session_id: &str, execution_id: Option<&str>) -> bool {
        let mut state = self.state();
        let Some(entry) = state.sessions.get_mut(session_id) else {
            return false;
        };
        let matches = entry
            .subscribers
            .get(connection_id)
            .is_some_and(|filter| execution_id.is_none() || filter.as_deref() == execution_id);
        if !matches {
            return false;
        }
        let removed = entry.subscribers.remove(connection_id).is_some();
        if entry.subscribers.is_empty() {
            state.sessions.remove(session_id);
        }
        removed
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.state()
            .sessions
            .get(session_id)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Connection ids subscribed to a session, sorted.
    pub fn subscriber_ids(&self, session_id: &str) -> Vec<ConnectionId> {
        self.state()
            .sessions
            .get(session_id)
            .map(|entry| {
                entry
                    .subscribers
                    .keys()
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    fn schedule_release(&self, session_id: String, execution_id: String) {
        let state = Arc::clone(&self.state);
        let release = move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            let still_closed = state
                .sessions
                .get(&session_id)
                .is_some_and(|entry| entry.closed_execution.as_deref() == Some(execution_id.as_str()));
            if still_closed {
                state.sessions.remove(&session_id);
                debug!(session_id = %session_id, "Released stream subscribers");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.grace.is_zero() => {
                let grace = self.grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    release();
                });
            }
            _ => release(),
        }
    }
}

impl EventSink for EventRelay {
    fn publish(&self, event: &StreamEvent) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(entry) = state.sessions.get_mut(&event.session_id) else {
            return;
        };

        if matches!(event.payload, StreamPayload::Start { .. }) {
            entry.closed_execution = None;
        }

        let mut dead = Vec::new();
        for (connection_id, filter) in &entry.subscribers {
            if filter.as_ref().is_some_and(|id| *id != event.execution_id) {
                continue;
            }
            let delivered = state
                .connections
                .get(connection_id)
                .is_some_and(|tx| tx.send(event.clone()).is_ok());
            if !delivered {
                dead.push(connection_id.clone());
            }
        }

        match &event.payload {
            StreamPayload::Complete { .. } => {
                entry.closed_execution = Some(event.execution_id.clone());
            }
            StreamPayload::Error { .. } => {
                state.sessions.remove(&event.session_id);
            }
            _ => {}
        }

        for connection_id in dead {
            debug!(connection_id = %connection_id, "Dropping dead relay connection");
            state.drop_connection(&connection_id);
        }

        drop(guard);
        if matches!(event.payload, StreamPayload::Complete { .. }) {
            self.schedule_release(event.session_id.clone(), event.execution_id.clone());
        }
    }
}
