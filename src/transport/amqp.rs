//! AMQP transport.

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::BasicPublishOptions,
};
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::{AmqpSnafu, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Publishes every message of a batch to one exchange with persistent
/// delivery. The channel is re-established lazily after a failure; the
/// transport stage's retry-with-backoff handles the time in between.
pub struct AmqpTransport {
    config: AmqpConfig,
    state: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpTransport {
    /// Connects eagerly so a misconfigured broker fails at startup.
    pub async fn new(config: AmqpConfig) -> Result<Self, TransportError> {
        let transport = Self {
            config,
            state: Mutex::new(None),
        };

        {
            let mut state = transport.state.lock().await;
            *state = Some(transport.connect().await?);
        }

        Ok(transport)
    }

    async fn connect(&self) -> Result<(Connection, Channel), TransportError> {
        let connection =
            Connection::connect(&self.config.url, ConnectionProperties::default())
                .await
                .context(AmqpSnafu)?;
        let channel = connection.create_channel().await.context(AmqpSnafu)?;

        Ok((connection, channel))
    }

    async fn publish_batch(
        &self,
        channel: &Channel,
        messages: &[String],
    ) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        for message in messages {
            channel
                .basic_publish(
                    &self.config.exchange,
                    &self.config.routing_key,
                    BasicPublishOptions::default(),
                    message.as_bytes(),
                    properties.clone(),
                )
                .await
                .context(AmqpSnafu)?
                .await
                .context(AmqpSnafu)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn deliver_messages(&self, messages: &[String]) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        if state
            .as_ref()
            .is_none_or(|(_, channel)| !channel.status().connected())
        {
            *state = Some(self.connect().await?);
        }

        let Some((_, channel)) = state.as_ref() else {
            unreachable!("state was just established");
        };

        let result = self.publish_batch(channel, messages).await;

        if result.is_err() {
            // Drop the broken channel; the next attempt reconnects.
            *state = None;
        }

        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        if let Some((connection, _)) = state.take() {
            if let Err(error) = connection.close(200, "shutting down").await {
                warn!(message = "Error closing the amqp connection.", %error);
            }
        }

        Ok(())
    }
}
