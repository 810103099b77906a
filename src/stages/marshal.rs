//! Marshal stage: records → JSON strings.

use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::warn;

use super::spawn_workers;
use crate::{channels::CHANNEL_CAPACITY, entry::EntryMap};

#[derive(Clone)]
pub struct MarshalStage {
    input: async_channel::Receiver<EntryMap>,
    output: async_channel::Sender<String>,
}

impl MarshalStage {
    pub fn spawn(
        tracker: &TaskTracker,
        parallelism: usize,
        input: async_channel::Receiver<EntryMap>,
    ) -> async_channel::Receiver<String> {
        let (output, downstream) = async_channel::bounded(CHANNEL_CAPACITY);
        let stage = Self { input, output };

        spawn_workers(tracker, parallelism, stage, Self::run);
        downstream
    }

    async fn run(self) {
        while let Ok(record) = self.input.recv().await {
            let message = match serde_json::to_string(&Value::Object(record)) {
                Ok(message) => message,
                Err(error) => {
                    warn!(message = "Error marshalling log entry; dropping it.", %error);
                    continue;
                }
            };

            if self.output.send(message).await.is_err() {
                return;
            }
        }
    }
}
