//! The push interface between a producer of stream events and a transport.

use std::sync::{Arc, Mutex};

use agentrelay_core::stream_event::StreamEvent;

/// Receives every event the registry emits, in emission order.
///
/// `publish` is called while the registry holds its session lock, so an
/// implementation must not block and must not call back into the registry.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &StreamEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn publish(&self, event: &StreamEvent) {
        (**self).publish(event);
    }
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &StreamEvent) {}
}

/// Keeps every published event in memory for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events of one session, in order.
    pub fn for_session(&self, session_id: &str) -> Vec<StreamEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .collect()
    }

    /// Wire tags of one session's events, in order.
    pub fn kinds(&self, session_id: &str) -> Vec<&'static str> {
        self.for_session(session_id).iter().map(StreamEvent::kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &StreamEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Publishes to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &StreamEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}
