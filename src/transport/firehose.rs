//! AWS Firehose transport.

use async_trait::async_trait;
use aws_sdk_firehose::{Client, primitives::Blob, types::Record};

use super::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    pub delivery_stream: String,
}

/// Ships each batch with one `PutRecordBatch` call. Records the service
/// reports as failed count as a delivery failure so the batch is retried;
/// duplicates across retries are acceptable under at-least-once delivery.
pub struct FirehoseTransport {
    client: Client,
    delivery_stream: String,
}

impl FirehoseTransport {
    pub async fn new(config: FirehoseConfig) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        Self {
            client: Client::new(&aws_config),
            delivery_stream: config.delivery_stream,
        }
    }
}

#[async_trait]
impl Transport for FirehoseTransport {
    async fn deliver_messages(&self, messages: &[String]) -> Result<(), TransportError> {
        let records = messages
            .iter()
            .map(|message| {
                Record::builder()
                    .data(Blob::new(message.as_bytes()))
                    .build()
                    .map_err(|error| TransportError::Firehose {
                        message: error.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .put_record_batch()
            .delivery_stream_name(&self.delivery_stream)
            .set_records(Some(records))
            .send()
            .await
            .map_err(|error| TransportError::Firehose {
                message: format!(
                    "unable to deliver to stream {}: {error}",
                    self.delivery_stream
                ),
            })?;

        if output.failed_put_count() > 0 {
            return Err(TransportError::Firehose {
                message: format!(
                    "{} records of the batch were not accepted",
                    output.failed_put_count()
                ),
            });
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
