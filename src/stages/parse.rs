//! Parse stage: raw entries → structured records.

use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::warn;

use super::spawn_workers;
use crate::{
    channels::CHANNEL_CAPACITY,
    entry::{Entry, EntryMap, EntryMapExt, LogFormat},
    parsers::{self, ParserConfig, base_map_mut},
};

/// Parses lines with the format-matching parser, extends the result with the
/// follower's metadata and sends it downstream. A line its format parser
/// rejects is downgraded to the plain parser rather than dropped.
#[derive(Clone)]
pub struct ParseStage {
    config: Arc<ParserConfig>,
    input: async_channel::Receiver<Entry>,
    output: async_channel::Sender<EntryMap>,
}

impl ParseStage {
    pub fn spawn(
        tracker: &TaskTracker,
        parallelism: usize,
        config: Arc<ParserConfig>,
        input: async_channel::Receiver<Entry>,
    ) -> async_channel::Receiver<EntryMap> {
        let (output, downstream) = async_channel::bounded(CHANNEL_CAPACITY);
        let stage = Self {
            config,
            input,
            output,
        };

        spawn_workers(tracker, parallelism, stage, Self::run);
        downstream
    }

    async fn run(self) {
        while let Ok(entry) = self.input.recv().await {
            let record = self.parse(&entry);

            if self.output.send(record).await.is_err() {
                return;
            }
        }
    }

    fn parse(&self, entry: &Entry) -> EntryMap {
        let parsed = match entry.format {
            LogFormat::Docker => parsers::parse_docker(&self.config, &entry.origin),
            LogFormat::Containerd => parsers::parse_containerd(&self.config, &entry.origin),
        };

        let mut record = parsed.unwrap_or_else(|error| {
            warn!(
                message = "Error parsing log entry; forwarding as plain.",
                %error,
            );
            parsers::parse_plain(&self.config, &entry.origin)
        });

        if self.config.extends_fields_key.is_empty() {
            record.extend_with(&entry.extends);
        } else {
            base_map_mut(&mut record, &self.config.extends_fields_key)
                .extend_with(&entry.extends);
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::{Value, json};

    use super::*;

    fn extends(value: Value) -> Arc<EntryMap> {
        match value {
            Value::Object(map) => Arc::new(map),
            _ => panic!("fixture must be an object"),
        }
    }

    fn stage_config() -> Arc<ParserConfig> {
        Arc::new(ParserConfig {
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        })
    }

    async fn run_one(config: Arc<ParserConfig>, entry: Entry) -> EntryMap {
        let tracker = TaskTracker::new();
        let (input_tx, input_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        let output = ParseStage::spawn(&tracker, 1, config, input_rx);

        input_tx.send(entry).await.unwrap();
        drop(input_tx);

        let record = output.recv().await.unwrap();
        tracker.close();
        tracker.wait().await;
        record
    }

    #[tokio::test]
    async fn docker_entries_are_parsed_and_extended() {
        let record = run_one(
            stage_config(),
            Entry {
                origin: Bytes::from_static(br#"{"log":"{\"level\":\"info\"}"}"#),
                format: LogFormat::Docker,
                extends: extends(json!({"container": "c"})),
            },
        )
        .await;

        assert_eq!(
            Value::Object(record),
            json!({"level": "info", "container": "c"})
        );
    }

    #[tokio::test]
    async fn unparseable_lines_are_downgraded_to_plain() {
        let record = run_one(
            stage_config(),
            Entry {
                origin: Bytes::from_static(b"definitely not json"),
                format: LogFormat::Docker,
                extends: extends(json!({"container": "c"})),
            },
        )
        .await;

        assert_eq!(
            Value::Object(record),
            json!({"msg": "definitely not json", "container": "c"})
        );
    }

    #[tokio::test]
    async fn extends_can_be_grouped_under_a_key() {
        let config = Arc::new(ParserConfig {
            extends_fields_key: "kubernetes".to_string(),
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        });

        let record = run_one(
            config,
            Entry {
                origin: Bytes::from_static(br#"{"log":"plain"}"#),
                format: LogFormat::Docker,
                extends: extends(json!({"pod": "p-1"})),
            },
        )
        .await;

        assert_eq!(
            Value::Object(record),
            json!({"msg": "plain", "kubernetes": {"pod": "p-1"}})
        );
    }
}
