//! Redis pub/sub implementation of [`Broker`].

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::broker::{Broker, BrokerError};

pub struct RedisBroker {
    client: redis::Client,
    /// Shared publishing connection, opened on first use.
    publisher: OnceCell<MultiplexedConnection>,
}

impl RedisBroker {
    /// Parse the URL. No connection is made until the first publish or
    /// subscribe.
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            publisher: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.publisher
            .get_or_try_init(|| async {
                debug!("Opening Redis publishing connection");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| BrokerError::Connect(e.to_string()))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        trace!(channel = %channel, receivers, "Published stream event");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, String>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let payloads = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(payloads.boxed())
    }
}
