//! Per-file follower: reads lines, persists its cursor, honors the rate.

use std::{
    num::NonZeroU32,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::FollowerMetrics;
use crate::{
    entry::{Entry, EntryMap, LogFormat},
    rates::Rater,
    readers::LineReader,
    storage::CursorStore,
};

/// Builds a token bucket with burst equal to the rate. Quotas are integral,
/// so the configured float rate rounds to a positive integer.
fn build_limiter(rate: f64) -> DefaultDirectRateLimiter {
    let per_second =
        NonZeroU32::new(rate.round().max(1.0) as u32).unwrap_or(NonZeroU32::MIN);

    RateLimiter::direct(Quota::per_second(per_second).allow_burst(per_second))
}

/// Collects log entries from one file and sends them downstream.
///
/// Three cooperating loops run under a shared stop token: the reader, the
/// cursor committer and the rate updater. The reader and the committer
/// mutually exclude around the reader+cursor pair, so a committed cursor
/// never runs ahead of output already surrendered to the pipeline.
pub struct Follower {
    path_key: String,
    format: LogFormat,
    namespace: String,
    pod: String,
    container: String,

    reader: tokio::sync::Mutex<LineReader>,
    storage: Arc<CursorStore>,
    rater: Arc<Rater>,
    metrics: Arc<dyn FollowerMetrics>,
    extends: Arc<EntryMap>,

    limiter: ArcSwap<DefaultDirectRateLimiter>,
    rate_current: Mutex<f64>,

    sleep_no_records: Duration,
    commit_interval: Duration,
    rate_update_interval: Duration,

    output: async_channel::Sender<Entry>,

    stop: CancellationToken,
    active: Arc<AtomicBool>,
    eof_shutdown: Arc<AtomicBool>,
}

pub(super) struct FollowerParts {
    pub path_key: String,
    pub format: LogFormat,
    pub reader: LineReader,
    pub storage: Arc<CursorStore>,
    pub rater: Arc<Rater>,
    pub metrics: Arc<dyn FollowerMetrics>,
    pub extends: Arc<EntryMap>,
    pub sleep_no_records: Duration,
    pub commit_interval: Duration,
    pub rate_update_interval: Duration,
    pub output: async_channel::Sender<Entry>,
    pub stop: CancellationToken,
    pub active: Arc<AtomicBool>,
    pub eof_shutdown: Arc<AtomicBool>,
}

impl Follower {
    pub(super) fn from_parts(parts: FollowerParts) -> Self {
        use crate::entry::EntryMapExt;

        let namespace = parts.extends.namespace_name().to_string();
        let pod = parts.extends.pod_name().to_string();
        let container = parts.extends.container_name().to_string();

        let rate = parts.rater.rate(&namespace, &pod);

        Self {
            path_key: parts.path_key,
            format: parts.format,
            namespace,
            pod,
            container,
            reader: tokio::sync::Mutex::new(parts.reader),
            storage: parts.storage,
            rater: parts.rater,
            metrics: parts.metrics,
            extends: parts.extends,
            limiter: ArcSwap::from_pointee(build_limiter(rate)),
            rate_current: Mutex::new(rate),
            sleep_no_records: parts.sleep_no_records,
            commit_interval: parts.commit_interval,
            rate_update_interval: parts.rate_update_interval,
            output: parts.output,
            stop: parts.stop,
            active: parts.active,
            eof_shutdown: parts.eof_shutdown,
        }
    }

    /// Runs the follower to completion: until the parent cancels, `stop` is
    /// requested, or the reader fails.
    pub async fn run(self: Arc<Self>) {
        info!(
            message = "Follower started.",
            path = %self.path_key,
            rate = *self.rate_current.lock().expect("rate lock poisoned"),
        );

        tokio::join!(
            self.reader_loop(),
            self.committer_loop(),
            self.rate_update_loop(),
        );

        self.finalize().await;
    }

    async fn reader_loop(&self) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }

            self.wait_for_token().await;

            match self.entry_proceed().await {
                Ok(true) => {}
                Ok(false) => {
                    if self.eof_shutdown.load(Ordering::Acquire) {
                        self.stop.cancel();
                        return;
                    }

                    tokio::select! {
                        _ = self.stop.cancelled() => return,
                        _ = sleep(self.sleep_no_records) => {}
                    }
                }
                Err(read_error) => {
                    info!(
                        message = "Reader can't acquire file or encountered an error; \
                                   removing cursor and stopping follower.",
                        path = %self.path_key,
                        error = %read_error,
                    );

                    if let Err(error) = self.storage.delete(&self.path_key) {
                        error!(message = "Unable to delete cursor.", %error);
                    }

                    // Release the file now so finalization does not re-commit
                    // a cursor that was just deleted.
                    self.reader.lock().await.close();
                    self.stop.cancel();
                    return;
                }
            }
        }
    }

    /// Reserves one token, charging any wait to the throttle-delay series.
    async fn wait_for_token(&self) {
        let limiter = self.limiter.load_full();
        let started = Instant::now();

        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = limiter.until_ready() => {}
        }

        self.metrics.increment_throttling_delay(
            &self.namespace,
            &self.pod,
            &self.container,
            started.elapsed().as_secs_f64(),
        );
    }

    /// Reads and forwards one record under the reader lock. Returns
    /// `Ok(false)` on the "no records" sentinel.
    async fn entry_proceed(&self) -> Result<bool, crate::readers::ReadError> {
        let mut reader = self.reader.lock().await;

        let Some((origin, prefix)) = reader.entry_read().await? else {
            return Ok(false);
        };

        if prefix {
            warn!(
                message = "Encountered a long line that doesn't fit into the reader buffer; \
                           forwarding the chunk as its own record.",
                path = %self.path_key,
            );
        }

        let entry = Entry {
            origin,
            format: self.format,
            extends: Arc::clone(&self.extends),
        };

        // The send happens under the reader lock: a cursor commit can never
        // slip between reading a line and surrendering it downstream.
        if self.output.send(entry).await.is_err() {
            warn!(message = "Pipeline input closed.", path = %self.path_key);
            self.stop.cancel();
            return Ok(false);
        }

        self.metrics
            .increment_log_message_count(&self.namespace, &self.pod, &self.container);
        Ok(true)
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

        if let Err(error) = self.storage.set(&self.path_key, &cursor) {
            info!(message = "Cursor commit failed.", path = %self.path_key, %error);
        }
    }

    async fn rate_update_loop(&self) {
        let mut ticker = interval_at(
            Instant::now() + self.rate_update_interval,
            self.rate_update_interval,
        );

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => {
                    self.set_rate(self.rater.rate(&self.namespace, &self.pod));
                }
            }
        }
    }

    /// Replaces the limiter when the applicable rate changed. The swap is a
    /// single pointer store; a reader mid-wait finishes on the old bucket
    /// and picks up the new one on its next reservation.
    fn set_rate(&self, rate: f64) {
        let mut current = self.rate_current.lock().expect("rate lock poisoned");

        if *current == rate {
            return;
        }

        *current = rate;
        self.limiter.store(Arc::new(build_limiter(rate)));
    }

    async fn finalize(&self) {
        {
            let mut reader = self.reader.lock().await;

            if reader.acquired() {
                let cursor = reader.cursor().to_string();

                if let Err(error) = self.storage.set(&self.path_key, &cursor) {
                    info!(message = "Final cursor commit failed.", %error);
                }
            }

            reader.close();
        }

        if !self
            .metrics
            .delete_throttling_delay(&self.namespace, &self.pod, &self.container)
        {
            warn!(
                message = "Failed removing throttling series.",
                namespace = %self.namespace,
                pod = %self.pod,
                container = %self.container,
                path = %self.path_key,
            );
        }

        self.active.store(false, Ordering::Release);
    }
}
