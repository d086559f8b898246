//! Cross-process delivery of stream events.
//!
//! A producer process publishes each event as JSON on the channel
//! `stream:{sessionId}`. Every gateway process pattern-subscribes to
//! `stream:*` and feeds what it receives into its local [`EventRelay`],
//! which fans it out to that process's connections.
//!
//! [`BrokerSink`] keeps emission order: events go through one queue and
//! are published one at a time by a single task.

use std::sync::Arc;
use std::time::Duration;

use agentrelay_core::stream_event::StreamEvent;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::relay::EventRelay;
use crate::sink::EventSink;

pub const CHANNEL_PREFIX: &str = "stream:";

/// Pattern covering every session channel.
pub const ALL_SESSIONS: &str = "stream:*";

pub fn channel_for(session_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{session_id}")
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// A pub/sub transport carrying serialized events between processes.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    /// Subscribe to a channel pattern (`prefix*`). The stream yields
    /// payloads in the order the broker delivers them.
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, String>, BrokerError>;
}

/// [`EventSink`] that publishes every event to a [`Broker`].
pub struct BrokerSink {
    queue: mpsc::UnboundedSender<StreamEvent>,
}

impl BrokerSink {
    /// Spawn the publishing task. Must be called inside a Tokio runtime.
    pub fn start(broker: Arc<dyn Broker>) -> (Self, JoinHandle<()>) {
        let (queue, mut pending) = mpsc::unbounded_channel::<StreamEvent>();

        let publisher = tokio::spawn(async move {
            while let Some(event) = pending.recv().await {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(session_id = %event.session_id, "Failed to encode stream event: {e}");
                        continue;
                    }
                };
                let channel = channel_for(&event.session_id);
                if let Err(e) = broker.publish(&channel, payload).await {
                    warn!(broker = broker.name(), channel = %channel, kind = event.kind(), "Dropped stream event: {e}");
                }
            }
            debug!("Broker publisher stopped");
        });

        (Self { queue }, publisher)
    }
}

impl EventSink for BrokerSink {
    fn publish(&self, event: &StreamEvent) {
        if self.queue.send(event.clone()).is_err() {
            warn!(session_id = %event.session_id, "Broker publisher is gone, event dropped");
        }
    }
}

/// Feed every event on the broker into `relay` until the subscription ends.
pub async fn forward(broker: &dyn Broker, relay: &EventRelay) -> Result<(), BrokerError> {
    let mut payloads = broker.subscribe(ALL_SESSIONS).await?;
    info!(broker = broker.name(), pattern = ALL_SESSIONS, "Relay subscribed to broker");

    while let Some(payload) = payloads.next().await {
        match serde_json::from_str::<StreamEvent>(&payload) {
            Ok(event) => relay.publish(&event),
            Err(e) => warn!(broker = broker.name(), "Ignoring undecodable stream event: {e}"),
        }
    }
    Ok(())
}

/// Run [`forward`] in the background, resubscribing after `retry` whenever
/// the subscription fails or ends.
pub fn spawn_forwarder(broker: Arc<dyn Broker>, relay: EventRelay, retry: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match forward(broker.as_ref(), &relay).await {
                Ok(()) => warn!(broker = broker.name(), "Broker subscription ended"),
                Err(e) => error!(broker = broker.name(), "Broker subscription failed: {e}"),
            }
            tokio::time::sleep(retry).await;
        }
    })
}
