//! End-to-end pipeline tests: entries in, delivered batches out.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio_util::task::TaskTracker;

use logship::{
    channels,
    entry::{Entry, EntryMap, LogFormat},
    parsers::{ParserConfig, SliStub},
    stages::{FilterStage, MarshalStage, ParseStage, SliStage, TransportStage},
    transport::{Transport, TransportError},
};

#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver_messages(&self, messages: &[String]) -> Result<(), TransportError> {
        self.delivered
            .lock()
            .unwrap()
            .extend(messages.iter().cloned());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Pipeline {
    entries: async_channel::Sender<Entry>,
    journald: async_channel::Sender<String>,
    transport: Arc<RecordingTransport>,
    tracker: TaskTracker,
}

/// Assembles parse → sli → filter → marshal → fan-in → transport, the same
/// shape the application wires up.
fn pipeline(config: ParserConfig, user_log_fields_key: &str) -> Pipeline {
    let tracker = TaskTracker::new();
    let transport = Arc::new(RecordingTransport::default());

    let (entries_tx, entries_rx) = async_channel::bounded(4);
    let (journald_tx, journald_rx) = async_channel::bounded(4);

    let parsed = ParseStage::spawn(&tracker, 2, Arc::new(config), entries_rx);
    let observed = SliStage::spawn(
        &tracker,
        2,
        user_log_fields_key.to_string(),
        Arc::new(SliStub),
        parsed,
    );
    let filtered = FilterStage::spawn(&tracker, 2, user_log_fields_key.to_string(), observed);
    let marshalled = MarshalStage::spawn(&tracker, 2, filtered);

    TransportStage::spawn(
        &tracker,
        2,
        Arc::clone(&transport) as Arc<dyn Transport>,
        100,
        Duration::from_millis(50),
        channels::merge(vec![marshalled, journald_rx]),
    );
    tracker.close();

    Pipeline {
        entries: entries_tx,
        journald: journald_tx,
        transport,
        tracker,
    }
}

fn docker_entry(line: &str, extends: Value) -> Entry {
    let extends = match extends {
        Value::Object(map) => map,
        _ => panic!("extends fixture must be an object"),
    };

    Entry {
        origin: Bytes::copy_from_slice(line.as_bytes()),
        format: LogFormat::Docker,
        extends: Arc::new(extends),
    }
}

async fn delivered(pipeline: Pipeline) -> Vec<Value> {
    drop(pipeline.entries);
    drop(pipeline.journald);
    pipeline.tracker.wait().await;

    pipeline
        .transport
        .delivered
        .lock()
        .unwrap()
        .iter()
        .map(|message| serde_json::from_str(message).unwrap())
        .collect()
}

#[tokio::test]
async fn docker_json_passthrough_reaches_the_transport() {
    let pipeline = pipeline(
        ParserConfig {
            raw_log_field_key: "log".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        },
        "",
    );

    pipeline
        .entries
        .send(docker_entry(
            r#"{"log":"hello world","key1":1}"#,
            json!({"container": "c"}),
        ))
        .await
        .unwrap();

    let delivered = delivered(pipeline).await;
    assert_eq!(
        delivered,
        vec![json!({"log": "hello world", "key1": 1, "container": "c"})]
    );
}

#[tokio::test]
async fn upstream_response_times_are_derived_in_flight() {
    let pipeline = pipeline(
        ParserConfig {
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        },
        "",
    );

    pipeline
        .entries
        .send(docker_entry(
            r#"{"log":"{\"upstream_response_time\":\"0.009, 1.142, 1.222\"}"}"#,
            json!({}),
        ))
        .await
        .unwrap();

    let delivered = delivered(pipeline).await;
    assert_eq!(
        delivered,
        vec![json!({
            "upstream_response_time": "0.009, 1.142, 1.222",
            "upstream_response_time_float": 1.222,
            "upstream_response_time_total": 2.373,
        })]
    );
}

#[tokio::test]
async fn records_flagged_logging_false_never_reach_the_transport() {
    let pipeline = pipeline(
        ParserConfig {
            user_log_fields_key: "log".to_string(),
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        },
        "log",
    );

    pipeline
        .entries
        .send(docker_entry(
            r#"{"log":"{\"logging\":false,\"sla\":true,\"x\":1}"}"#,
            json!({}),
        ))
        .await
        .unwrap();
    pipeline
        .entries
        .send(docker_entry(r#"{"log":"{\"kept\":true}"}"#, json!({})))
        .await
        .unwrap();

    let delivered = delivered(pipeline).await;
    assert_eq!(delivered, vec![json!({"log": {"kept": true}})]);
}

#[tokio::test]
async fn journald_strings_bypass_the_parsing_stages() {
    let pipeline = pipeline(
        ParserConfig {
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        },
        "",
    );

    pipeline
        .journald
        .send(r#"{"MESSAGE":"from the journal"}"#.to_string())
        .await
        .unwrap();

    let delivered = delivered(pipeline).await;
    assert_eq!(delivered, vec![json!({"MESSAGE": "from the journal"})]);
}

#[tokio::test]
async fn containerd_lines_flow_through_with_their_cri_fields() {
    let pipeline = pipeline(
        ParserConfig {
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        },
        "",
    );

    pipeline
        .entries
        .send(Entry {
            origin: Bytes::from_static(b"2020-09-10T07:00:03.585507743Z stdout F my message"),
            format: LogFormat::Containerd,
            extends: Arc::new(EntryMap::new()),
        })
        .await
        .unwrap();

    let delivered = delivered(pipeline).await;
    assert_eq!(
        delivered,
        vec![json!({
            "time": "2020-09-10T07:00:03.585507743Z",
            "stream": "stdout",
            "msg": "my message",
        })]
    );
}
