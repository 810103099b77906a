//! System journal follower.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat};
use serde_json::Value;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    entry::{EntryMap, EntryMapExt, JOURNAL_CURSOR_KEY, LABEL_TIME},
    readers::JournaldReader,
    storage::CursorStore,
};

/// Journal fields kept in the emitted record, next to the converted `time`.
const KEPT_FIELDS: &[&str] = &[
    "SYSLOG_IDENTIFIER",
    "PRIORITY",
    "SYSLOG_PID",
    "SYSLOG_FACILITY",
    "SYSTEMD_UNIT",
    "MESSAGE",
    LABEL_TIME,
];

const REALTIME_FIELD: &str = "__REALTIME_TIMESTAMP";
const SYSTEMD_UNIT_FIELD: &str = "_SYSTEMD_UNIT";

/// Follows the system journal, emitting ready-to-ship JSON strings. Runs a
/// reader loop and a cursor committer under one stop token; the journal
/// cursor is committed under the reserved `system.journal` key.
pub struct JournaldFollower {
    reader: tokio::sync::Mutex<JournaldReader>,
    storage: Arc<CursorStore>,
    extends: EntryMap,

    sleep_no_records: Duration,
    commit_interval: Duration,

    output: async_channel::Sender<String>,
    stop: CancellationToken,
}

impl JournaldFollower {
    pub fn new(
        reader: JournaldReader,
        storage: Arc<CursorStore>,
        extends: EntryMap,
        sleep_no_records: Duration,
        commit_interval: Duration,
        output: async_channel::Sender<String>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(reader),
            storage,
            extends,
            sleep_no_records,
            commit_interval,
            output,
            stop,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(message = "Journal follower started.");

        tokio::join!(self.reader_loop(), self.committer_loop());
        self.finalize().await;
    }

    async fn reader_loop(&self) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }

            match self.entry_proceed().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = self.stop.cancelled() => return,
                        _ = sleep(self.sleep_no_records) => {}
                    }
                }
                Err(error) => {
                    warn!(message = "Journal follower failed to proceed.", %error);

                    tokio::select! {
                        _ = self.stop.cancelled() => return,
                        _ = sleep(self.sleep_no_records) => {}
                    }
                }
            }
        }
    }

    async fn entry_proceed(&self) -> anyhow::Result<bool> {
        let mut reader = self.reader.lock().await;

        let Some(record) = reader.entry_read().await? else {
            return Ok(false);
        };

        let message = self.render_record(record)?;

        // Sending under the reader lock keeps the committed cursor behind
        // every record already surrendered downstream.
        if self.output.send(message).await.is_err() {
            self.stop.cancel();
        }

        Ok(true)
    }

    /// Converts the raw journal field map into the shipped record: RFC 3339
    /// `time`, the syslog field allowlist, and the node metadata extends.
    fn render_record(&self, mut record: EntryMap) -> anyhow::Result<String> {
        let realtime = record
            .str_field(REALTIME_FIELD)
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("incorrect entry timestamp"))?;

        let timestamp = DateTime::from_timestamp_micros(realtime)
            .ok_or_else(|| anyhow::anyhow!("incorrect entry timestamp"))?
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        if let Some(unit) = record.get(SYSTEMD_UNIT_FIELD).cloned() {
            record.insert("SYSTEMD_UNIT".to_string(), unit);
        }

        let mut record = record.filtered(KEPT_FIELDS);
        record.insert(LABEL_TIME.to_string(), Value::String(timestamp));
        record.extend_with(&self.extends);

        Ok(serde_json::to_string(&record)?)
    }

    async fn committer_loop(&self) {
        let mut ticker = interval_at(
            Instant::now() + self.commit_interval,
            self.commit_interval,
        );

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => self.commit_cursor().await,
            }
        }
    }

    async fn commit_cursor(&self) {
        let reader = self.reader.lock().await;
        let cursor = reader.cursor().to_string();

        if cursor.is_empty() {
            return;
        }

        if let Err(error) = self.storage.set(JOURNAL_CURSOR_KEY, &cursor) {
            info!(message = "Journal cursor commit failed.", %error);
        }
    }

    async fn finalize(&self) {
        let mut reader = self.reader.lock().await;

        if reader.acquired() {
            let cursor = reader.cursor().to_string();

            if !cursor.is_empty()
                && let Err(error) = self.storage.set(JOURNAL_CURSOR_KEY, &cursor)
            {
                info!(message = "Final journal cursor commit failed.", %error);
            }
        }

        reader.close().await;
    }
}
