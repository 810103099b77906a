//! Reconciliation of discovered targets with the live follower pool.

mod factory;
mod follower;
mod journald_follower;
mod pool;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::time::{self, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, warn};

pub use factory::{FactoryError, FollowerConfig, FollowerFactory, JournaldConfig};
pub use follower::Follower;
pub use journald_follower::JournaldFollower;
pub use pool::{FollowerHandle, FollowerPool};

use crate::{
    containers::{TargetProvider, Targets},
    entry::{Entry, JOURNAL_CURSOR_KEY},
    storage::CursorStore,
};

/// Metrics surface the followers write to.
pub trait FollowerMetrics: Send + Sync {
    fn increment_log_message_count(&self, namespace: &str, pod: &str, container: &str);
    fn increment_throttling_delay(&self, namespace: &str, pod: &str, container: &str, value: f64);
    fn delete_throttling_delay(&self, namespace: &str, pod: &str, container: &str) -> bool;
}

/// Starts and stops followers according to the target provider's view,
/// multiplexing their output into one channel; optionally runs the journal
/// follower and pipes its output separately.
pub struct Dispatcher {
    pool: FollowerPool,
    ignored: HashSet<PathBuf>,

    provider: Arc<dyn TargetProvider>,
    factory: FollowerFactory,
    storage: Arc<CursorStore>,

    start_journald: bool,
    refresh_interval: Duration,

    output: async_channel::Sender<Entry>,
    output_journald: async_channel::Sender<String>,

    tracker: TaskTracker,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: FollowerFactory,
        provider: Arc<dyn TargetProvider>,
        storage: Arc<CursorStore>,
        start_journald: bool,
        refresh_interval: Duration,
        output: async_channel::Sender<Entry>,
        output_journald: async_channel::Sender<String>,
    ) -> Self {
        Self {
            pool: FollowerPool::new(),
            ignored: HashSet::new(),
            provider,
            factory,
            storage,
            start_journald,
            refresh_interval,
            output,
            output_journald,
            tracker: TaskTracker::new(),
        }
    }

    /// Runs the reconciliation loop until `token` cancels, then waits for
    /// every spawned follower to finalize. The output channels close when
    /// the dispatcher and its followers have dropped their senders.
    pub async fn run(mut self, token: CancellationToken) {
        if self.start_journald {
            self.start_journald_follower(&token);
        }

        let mut ticker = time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.dispatch(&token).await {
                        error!(message = "Unable to get the targets list.", %error);
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
    }

    /// One reconciliation pass: remove orphans, prune cursors and the
    /// ignore set, then start followers for new targets.
    async fn dispatch(&mut self, token: &CancellationToken) -> Result<(), crate::containers::TargetError> {
        let targets = self.provider.targets()?;

        self.remove_orphans(&targets);
        self.start_followers(&targets, token).await;
        Ok(())
    }

    fn remove_orphans(&mut self, targets: &Targets) {
        for (path, handle) in self.pool.snapshot() {
            match targets.get(&path) {
                // The target disappeared from the host: stop tailing.
                None => handle.stop(),
                // Still on disk but not running: drain to EOF, then skip it
                // on later ticks.
                Some(target) if !target.running => {
                    handle.set_eof_shutdown();
                    self.ignored.insert(path.clone());
                }
                Some(_) => {}
            }

            if !handle.active() {
                self.pool.remove(&path);
            }
        }

        for key in self.storage.keys() {
            if key == JOURNAL_CURSOR_KEY {
                continue;
            }

            if targets.contains_key(Path::new(&key)) {
                continue;
            }

            if let Err(error) = self.storage.delete(&key) {
                error!(message = "Unable to delete orphan cursor.", %key, %error);
            }
        }

        self.ignored.retain(|path| targets.contains_key(path));
    }

    async fn start_followers(&mut self, targets: &Targets, token: &CancellationToken) {
        for (path, target) in targets {
            if self.pool.get(path).is_some() || self.ignored.contains(path) {
                continue;
            }

            // The journal shares the cursor namespace through one reserved
            // key; a colliding container path must not hijack it.
            if *path == Path::new(JOURNAL_CURSOR_KEY) {
                error!(
                    message = "Target path collides with the reserved journal cursor key; refusing to follow it.",
                    path = %path.display(),
                );
                continue;
            }

            match self.factory.follower(target, self.output.clone(), token).await {
                Ok((follower, handle)) => {
                    self.tracker.spawn(follower.run());
                    self.pool.add(path.clone(), handle);
                }
                Err(error) => {
                    warn!(message = "Unable to start follower.", %error);
                }
            }
        }
    }

    fn start_journald_follower(&self, token: &CancellationToken) {
        match self
            .factory
            .journald_follower(self.output_journald.clone(), token)
        {
            Ok(follower) => {
                self.tracker.spawn(follower.run());
            }
            Err(error) => {
                error!(message = "Unable to initialize the journal follower.", %error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        containers::{Target, TargetError},
        entry::{EntryMap, LogFormat},
        rates::{RateRecordsProviderStub, Rater},
    };

    struct NullMetrics;

    impl FollowerMetrics for NullMetrics {
        fn increment_log_message_count(&self, _: &str, _: &str, _: &str) {}
        fn increment_throttling_delay(&self, _: &str, _: &str, _: &str, _: f64) {}
        fn delete_throttling_delay(&self, _: &str, _: &str, _: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct StubProvider {
        targets: Mutex<Targets>,
        fail: Mutex<bool>,
    }

    impl StubProvider {
        fn set_targets(&self, targets: Vec<Target>) {
            *self.targets.lock().unwrap() = targets
                .into_iter()
                .map(|target| (target.path.clone(), target))
                .collect();
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl TargetProvider for StubProvider {
        fn targets(&self) -> Result<Targets, TargetError> {
            if *self.fail.lock().unwrap() {
                return Err(TargetError::ReadDir {
                    path: PathBuf::from("/stub"),
                    source: std::io::Error::other("stub failure"),
                });
            }

            Ok(self.targets.lock().unwrap().clone())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        provider: Arc<StubProvider>,
        storage: Arc<CursorStore>,
        output: async_channel::Receiver<Entry>,
        token: CancellationToken,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(CursorStore::open(dir.path().join("cursors.pos")).unwrap());
        let provider = Arc::new(StubProvider::default());
        let (output_tx, output_rx) = async_channel::bounded(64);
        let (journald_tx, _journald_rx) = async_channel::bounded(1);

        let factory = FollowerFactory::new(
            FollowerConfig {
                reader_buffer_size: 1024,
                from_tail: false,
                sleep_no_records: Duration::from_millis(5),
                commit_interval: Duration::from_secs(3600),
                rate_update_interval: Duration::from_secs(3600),
            },
            JournaldConfig {
                machine_id_path: PathBuf::from("/nonexistent/machine-id"),
                journald_path: PathBuf::from("/var/log/journal"),
            },
            EntryMap::new(),
            Arc::clone(&storage),
            Arc::new(Rater::new(Arc::new(RateRecordsProviderStub), 1000.0).unwrap()),
            Arc::new(NullMetrics),
        );

        let dispatcher = Dispatcher::new(
            factory,
            Arc::clone(&provider) as Arc<dyn TargetProvider>,
            Arc::clone(&storage),
            false,
            Duration::from_secs(3600),
            output_tx,
            journald_tx,
        );

        Fixture {
            dispatcher,
            provider,
            storage,
            output: output_rx,
            token: CancellationToken::new(),
            dir,
        }
    }

    fn target_at(dir: &Path, name: &str, running: bool) -> Target {
        let path = dir.join(name);

        if !path.exists() {
            std::fs::write(&path, format!("line from {name}\n")).unwrap();
        }

        Target {
            path,
            id: format!("{name}-id"),
            format: LogFormat::Docker,
            running,
            namespace: "ns".to_string(),
            pod: format!("{name}-pod"),
            container: name.to_string(),
        }
    }

    #[tokio::test]
    async fn starts_followers_for_new_targets_and_keeps_one_per_path() {
        let mut fixture = fixture();
        let target = target_at(fixture.dir.path(), "a.log", true);
        fixture.provider.set_targets(vec![target.clone()]);

        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();
        assert!(fixture.dispatcher.pool.get(&target.path).is_some());

        // A second pass over the same view must not spawn a duplicate.
        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();
        assert_eq!(fixture.dispatcher.pool.snapshot().len(), 1);

        let entry = fixture.output.recv().await.unwrap();
        assert_eq!(entry.origin.as_ref(), b"line from a.log");

        fixture.token.cancel();
        fixture.dispatcher.tracker.close();
        fixture.dispatcher.tracker.wait().await;
    }

    #[tokio::test]
    async fn provider_errors_leave_the_pool_untouched() {
        let mut fixture = fixture();
        let target = target_at(fixture.dir.path(), "a.log", true);
        fixture.provider.set_targets(vec![target.clone()]);

        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();

        fixture.provider.set_fail(true);
        assert!(fixture.dispatcher.dispatch(&fixture.token).await.is_err());
        assert!(fixture.dispatcher.pool.get(&target.path).is_some());

        fixture.token.cancel();
        fixture.dispatcher.tracker.close();
        fixture.dispatcher.tracker.wait().await;
    }

    #[tokio::test]
    async fn orphan_cursors_are_pruned_and_the_journal_key_is_reserved() {
        let mut fixture = fixture();
        fixture.storage.set("/gone/away.log", "1;2;3").unwrap();
        fixture.storage.set(JOURNAL_CURSOR_KEY, "token").unwrap();

        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();

        assert_eq!(fixture.storage.get("/gone/away.log"), "");
        assert_eq!(fixture.storage.get(JOURNAL_CURSOR_KEY), "token");
    }

    #[tokio::test]
    async fn stopped_targets_drain_and_are_ignored_until_gone() {
        let mut fixture = fixture();
        let running = target_at(fixture.dir.path(), "a.log", true);
        fixture.provider.set_targets(vec![running.clone()]);
        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();

        // Drain the single line so the follower can see EOF.
        let entry = fixture.output.recv().await.unwrap();
        assert_eq!(entry.origin.as_ref(), b"line from a.log");

        let stopped = Target {
            running: false,
            ..running.clone()
        };
        fixture.provider.set_targets(vec![stopped.clone()]);
        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();
        assert!(fixture.dispatcher.ignored.contains(&running.path));

        // Give the drained follower a moment to finalize, then reconcile
        // again: the pool entry goes away, the ignore mark stays while the
        // target is still present.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();
        assert!(fixture.dispatcher.pool.get(&running.path).is_none());
        assert!(fixture.dispatcher.ignored.contains(&running.path));

        // Once the target disappears the ignore mark is dropped too.
        fixture.provider.set_targets(vec![]);
        fixture.dispatcher.dispatch(&fixture.token).await.unwrap();
        assert!(!fixture.dispatcher.ignored.contains(&running.path));

        fixture.token.cancel();
        fixture.dispatcher.tracker.close();
        fixture.dispatcher.tracker.wait().await;
    }

    #[tokio::test]
    async fn run_closes_outputs_after_followers_finish() {
        let fixture = fixture();
        let target = target_at(fixture.dir.path(), "a.log", true);
        fixture.provider.set_targets(vec![target]);

        let output = fixture.output.clone();
        let token = fixture.token.clone();
        let task = tokio::spawn(fixture.dispatcher.run(token.clone()));

        assert_eq!(output.recv().await.unwrap().origin.as_ref(), b"line from a.log");

        token.cancel();
        task.await.unwrap();

        // All senders are gone now: the dispatcher's own clone was dropped
        // with it and the followers have returned.
        assert!(output.recv().await.is_err());
    }
}
