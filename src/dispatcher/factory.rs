//! Follower construction.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use super::{
    FollowerMetrics,
    follower::{Follower, FollowerParts},
    journald_follower::JournaldFollower,
    pool::FollowerHandle,
};
use crate::{
    containers::Target,
    entry::{
        self, Entry, EntryMap, JOURNAL_NAMESPACE, KUBERNETES_NAMESPACE_NAME,
    },
    rates::Rater,
    readers::{self, Cursor, JournaldReader, LineReader},
    storage::CursorStore,
};

#[derive(Debug, Snafu)]
pub enum FactoryError {
    #[snafu(display("unable to initiate line reader for '{}': {source}", path.display()))]
    Reader {
        path: PathBuf,
        source: readers::ReadError,
    },

    #[snafu(display("unable to obtain the journal directory: {source}"))]
    JournalDirectory { source: readers::JournaldReadError },

    #[snafu(display("unable to initialize the journal reader: {source}"))]
    JournalReader { source: readers::JournaldReadError },
}

/// Timing knobs shared by all followers.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub reader_buffer_size: usize,
    pub from_tail: bool,
    pub sleep_no_records: Duration,
    pub commit_interval: Duration,
    pub rate_update_interval: Duration,
}

/// Journal reader configuration.
#[derive(Debug, Clone)]
pub struct JournaldConfig {
    pub machine_id_path: PathBuf,
    pub journald_path: PathBuf,
}

/// Builds followers for the dispatcher, wiring each one to the shared
/// cursor store, rater and metrics collector.
pub struct FollowerFactory {
    config: FollowerConfig,
    journald: JournaldConfig,
    node_extends: EntryMap,
    storage: Arc<CursorStore>,
    rater: Arc<Rater>,
    metrics: Arc<dyn FollowerMetrics>,
}

impl FollowerFactory {
    pub fn new(
        config: FollowerConfig,
        journald: JournaldConfig,
        node_extends: EntryMap,
        storage: Arc<CursorStore>,
        rater: Arc<Rater>,
        metrics: Arc<dyn FollowerMetrics>,
    ) -> Self {
        Self {
            config,
            journald,
            node_extends,
            storage,
            rater,
            metrics,
        }
    }

    /// Builds a follower for `target`, resuming from the stored cursor when
    /// its file identity still matches.
    pub async fn follower(
        &self,
        target: &Target,
        output: async_channel::Sender<Entry>,
        parent: &CancellationToken,
    ) -> Result<(Arc<Follower>, FollowerHandle), FactoryError> {
        let path_key = target.path.to_string_lossy().into_owned();
        let stored_cursor = self
            .storage
            .get(&path_key)
            .parse::<Cursor>()
            .unwrap_or_default();

        let reader = LineReader::new(
            &target.path,
            self.config.reader_buffer_size,
            stored_cursor,
            self.config.from_tail,
        )
        .await
        .context(ReaderSnafu {
            path: target.path.clone(),
        })?;

        let handle = FollowerHandle::new(parent.child_token());
        let follower = Follower::from_parts(FollowerParts {
            path_key,
            format: target.format,
            reader,
            storage: Arc::clone(&self.storage),
            rater: Arc::clone(&self.rater),
            metrics: Arc::clone(&self.metrics),
            extends: Arc::new(self.container_extends(target)),
            sleep_no_records: self.config.sleep_no_records,
            commit_interval: self.config.commit_interval,
            rate_update_interval: self.config.rate_update_interval,
            output,
            stop: handle.stop_token(),
            active: handle.active_flag(),
            eof_shutdown: handle.eof_shutdown_flag(),
        });

        Ok((Arc::new(follower), handle))
    }

    /// Builds the journal follower, resuming from the reserved cursor key.
    pub fn journald_follower(
        &self,
        output: async_channel::Sender<String>,
        parent: &CancellationToken,
    ) -> Result<Arc<JournaldFollower>, FactoryError> {
        let directory = readers::journal_directory(
            &self.journald.machine_id_path,
            &self.journald.journald_path,
        )
        .context(JournalDirectorySnafu)?;

        let cursor = self.storage.get(entry::JOURNAL_CURSOR_KEY);
        let reader =
            JournaldReader::new(directory, cursor).context(JournalReaderSnafu)?;

        let mut extends = self.node_extends.clone();
        extends.remove(entry::LABEL_LOG_TYPE);
        extends.insert(
            KUBERNETES_NAMESPACE_NAME.to_string(),
            Value::String(JOURNAL_NAMESPACE.to_string()),
        );

        Ok(Arc::new(JournaldFollower::new(
            reader,
            Arc::clone(&self.storage),
            extends,
            self.config.sleep_no_records,
            self.config.commit_interval,
            output,
            parent.child_token(),
        )))
    }

    /// Node-level metadata merged with the per-container labels.
    fn container_extends(&self, target: &Target) -> EntryMap {
        let mut extends = self.node_extends.clone();

        extends.insert(
            entry::LABEL_CONTAINER_ID.to_string(),
            Value::String(target.id.clone()),
        );
        extends.insert(
            entry::LABEL_LOGSTASH_NAMESPACE.to_string(),
            Value::String(target.namespace.clone()),
        );
        extends.insert(
            entry::KUBERNETES_POD_NAME.to_string(),
            Value::String(target.pod.clone()),
        );
        extends.insert(
            KUBERNETES_NAMESPACE_NAME.to_string(),
            Value::String(target.namespace.clone()),
        );
        extends.insert(
            entry::KUBERNETES_CONTAINER_NAME.to_string(),
            Value::String(target.container.clone()),
        );

        extends
    }
}
