//! Message transports.

mod amqp;
mod firehose;
mod redis;

use async_trait::async_trait;
use snafu::Snafu;

pub use amqp::{AmqpConfig, AmqpTransport};
pub use firehose::{FirehoseConfig, FirehoseTransport};
pub use redis::{RedisConfig, RedisTransport};

/* Transport type names accepted by the configuration. */
pub const TYPE_AMQP: &str = "amqp";
pub const TYPE_REDIS: &str = "redis";
pub const TYPE_FIREHOSE: &str = "firehose";
pub const TYPES_SUPPORTED: &[&str] = &[TYPE_AMQP, TYPE_REDIS, TYPE_FIREHOSE];

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("amqp failure: {source}"))]
    Amqp { source: lapin::Error },

    #[snafu(display("redis failure: {source}"))]
    Redis { source: ::redis::RedisError },

    #[snafu(display("firehose delivery failed: {message}"))]
    Firehose { message: String },

    #[snafu(display("transport unavailable: {message}"))]
    Unavailable { message: String },
}

/// Delivery contract shared by all transports. A delivery error is treated
/// as transient by the transport stage: the batch is retained and retried.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver_messages(&self, messages: &[String]) -> Result<(), TransportError>;

    /// Called once at shutdown.
    async fn close(&self) -> Result<(), TransportError>;
}
