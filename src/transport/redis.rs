//! Redis transport.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use snafu::ResultExt;
use tokio::sync::Mutex;

use super::{RedisSnafu, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub hostname: String,
    pub password: String,
    pub key: String,
}

impl RedisConfig {
    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}", self.hostname)
        } else {
            format!("redis://:{}@{}", self.password, self.hostname)
        }
    }
}

/// Pushes each batch onto one Redis list with a single `RPUSH`. The
/// connection manager reconnects on its own; it is created lazily so a
/// temporarily absent Redis does not fail startup.
pub struct RedisTransport {
    client: redis::Client,
    key: String,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisTransport {
    pub fn new(config: RedisConfig) -> Result<Self, TransportError> {
        let client = redis::Client::open(config.url()).context(RedisSnafu)?;

        Ok(Self {
            client,
            key: config.key,
            manager: Mutex::new(None),
        })
    }

    async fn manager(&self) -> Result<ConnectionManager, TransportError> {
        let mut manager = self.manager.lock().await;

        if let Some(manager) = manager.as_ref() {
            return Ok(manager.clone());
        }

        let created = ConnectionManager::new(self.client.clone())
            .await
            .context(RedisSnafu)?;
        *manager = Some(created.clone());
        Ok(created)
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn deliver_messages(&self, messages: &[String]) -> Result<(), TransportError> {
        let mut manager = self.manager().await?;

        let mut command = redis::cmd("RPUSH");
        command.arg(&self.key);

        for message in messages {
            command.arg(message);
        }

        command
            .query_async::<()>(&mut manager)
            .await
            .context(RedisSnafu)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut manager = self.manager.lock().await;
        *manager = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_embeds_the_password_only_when_set() {
        let without = RedisConfig {
            hostname: "localhost:6379".to_string(),
            password: String::new(),
            key: "k8s-logs".to_string(),
        };
        assert_eq!(without.url(), "redis://localhost:6379");

        let with = RedisConfig {
            password: "secret".to_string(),
            ..without
        };
        assert_eq!(with.url(), "redis://:secret@localhost:6379");
    }
}
