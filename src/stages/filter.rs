//! Filter stage: drops records by the `logging=false` convention and strips
//! the processing control keys.

use serde_json::Value;
use tokio_util::task::TaskTracker;

use super::spawn_workers;
use crate::{
    channels::CHANNEL_CAPACITY,
    entry::EntryMap,
    parsers::{LOG_KEY_LOGGING, LOG_KEY_SLA},
};

#[derive(Clone)]
pub struct FilterStage {
    user_log_fields_key: String,
    input: async_channel::Receiver<EntryMap>,
    output: async_channel::Sender<EntryMap>,
}

impl FilterStage {
    pub fn spawn(
        tracker: &TaskTracker,
        parallelism: usize,
        user_log_fields_key: String,
        input: async_channel::Receiver<EntryMap>,
    ) -> async_channel::Receiver<EntryMap> {
        let (output, downstream) = async_channel::bounded(CHANNEL_CAPACITY);
        let stage = Self {
            user_log_fields_key,
            input,
            output,
        };

        spawn_workers(tracker, parallelism, stage, Self::run);
        downstream
    }

    async fn run(self) {
        while let Ok(mut record) = self.input.recv().await {
            if !self.strip_control_fields(&mut record) {
                continue;
            }

            if self.output.send(record).await.is_err() {
                return;
            }
        }
    }

    /// Removes the control keys from the user submap (or the root) and
    /// returns whether the record should be forwarded.
    fn strip_control_fields(&self, record: &mut EntryMap) -> bool {
        let base = if self.user_log_fields_key.is_empty() {
            record
        } else {
            match record.get_mut(&self.user_log_fields_key) {
                Some(Value::Object(submap)) => submap,
                // No user submap to read the convention from; forward as-is.
                _ => return true,
            }
        };

        let logging = base
            .remove(LOG_KEY_LOGGING)
            .and_then(|value| value.as_bool())
            .unwrap_or(true);
        base.remove(LOG_KEY_SLA);

        logging
    }
}
