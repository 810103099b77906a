//! Transport stage: batches messages and delivers them at-least-once.

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, interval_at, sleep};
use tokio_util::task::TaskTracker;
use tracing::error;

use super::spawn_workers;
use crate::transport::{Transport, TransportError};

/// How long to wait between delivery attempts while the transport is
/// unavailable.
pub const SLEEP_TRANSPORT_UNAVAILABLE: Duration = Duration::from_secs(3);

/// Stacks messages into batches and flushes them on a size or time trigger.
/// A failed delivery keeps the buffer for the next attempt; only the final
/// flush on input close discards it regardless of outcome. Every worker
/// owns its own buffer.
#[derive(Clone)]
pub struct TransportStage {
    client: Arc<dyn Transport>,
    buffer_size_max: usize,
    flush_interval: Duration,
    input: async_channel::Receiver<String>,
}

impl TransportStage {
    pub fn spawn(
        tracker: &TaskTracker,
        parallelism: usize,
        client: Arc<dyn Transport>,
        buffer_size_max: usize,
        flush_interval: Duration,
        input: async_channel::Receiver<String>,
    ) {
        let stage = Self {
            client,
            buffer_size_max,
            flush_interval,
            input,
        };

        spawn_workers(tracker, parallelism, stage, Self::run);
    }

    async fn run(self) {
        let mut ticker = interval_at(
            Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        let mut buffer: Vec<String> = Vec::with_capacity(self.buffer_size_max);

        loop {
            if buffer.len() >= self.buffer_size_max {
                if let Err(error) = self.flush(&mut buffer, false).await {
                    error!(
                        message = "Failed flushing buffer by size; keeping current buffer.",
                        records = buffer.len(),
                        %error,
                    );
                    sleep(SLEEP_TRANSPORT_UNAVAILABLE).await;
                    continue;
                }
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.flush(&mut buffer, false).await {
                        error!(
                            message = "Failed flushing buffer by timeout; keeping current buffer.",
                            records = buffer.len(),
                            %error,
                        );
                        sleep(SLEEP_TRANSPORT_UNAVAILABLE).await;
                    }
                }
                message = self.input.recv() => match message {
                    Ok(message) => buffer.push(message),
                    Err(_) => {
                        let records = buffer.len();

                        if let Err(error) = self.flush(&mut buffer, true).await {
                            error!(
                                message = "Failed flushing buffer while shutting down; \
                                           the current buffer is lost.",
                                records,
                                %error,
                            );
                        }

                        return;
                    }
                }
            }
        }
    }

    /// Delivers the buffered batch. On success the buffer is emptied; on
    /// failure it is kept, unless `force` discards it anyway.
    async fn flush(
        &self,
        buffer: &mut Vec<String>,
        force: bool,
    ) -> Result<(), TransportError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let result = self.client.deliver_messages(buffer).await;

        if result.is_ok() || force {
            buffer.clear();
        }

        result
    }
}
