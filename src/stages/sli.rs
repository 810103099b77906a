//! SLI stage: pass-through with a metrics side effect.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::task::TaskTracker;

use super::spawn_workers;
use crate::{channels::CHANNEL_CAPACITY, entry::EntryMap, parsers::SliObserver};

/// Observes SLI metrics on the user-log submap (or the record root) and
/// forwards every record unchanged.
#[derive(Clone)]
pub struct SliStage {
    user_log_fields_key: String,
    observer: Arc<dyn SliObserver>,
    input: async_channel::Receiver<EntryMap>,
    output: async_channel::Sender<EntryMap>,
}

impl SliStage {
    pub fn spawn(
        tracker: &TaskTracker,
        parallelism: usize,
        user_log_fields_key: String,
        observer: Arc<dyn SliObserver>,
        input: async_channel::Receiver<EntryMap>,
    ) -> async_channel::Receiver<EntryMap> {
        let (output, downstream) = async_channel::bounded(CHANNEL_CAPACITY);
        let stage = Self {
            user_log_fields_key,
            observer,
            input,
            output,
        };

        spawn_workers(tracker, parallelism, stage, Self::run);
        downstream
    }

    async fn run(self) {
        while let Ok(record) = self.input.recv().await {
            self.observe(&record);

            if self.output.send(record).await.is_err() {
                return;
            }
        }
    }

    fn observe(&self, record: &EntryMap) {
        if self.user_log_fields_key.is_empty() {
            self.observer.observe(record);
            return;
        }

        if let Some(Value::Object(submap)) = record.get(&self.user_log_fields_key) {
            self.observer.observe(submap);
        }
    }
}
