//! Follower pool and per-follower control handles.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio_util::sync::CancellationToken;

/// Control surface the dispatcher keeps for a spawned follower.
#[derive(Debug, Clone)]
pub struct FollowerHandle {
    stop: CancellationToken,
    active: Arc<AtomicBool>,
    eof_shutdown: Arc<AtomicBool>,
}

impl FollowerHandle {
    pub(crate) fn new(stop: CancellationToken) -> Self {
        Self {
            stop,
            active: Arc::new(AtomicBool::new(true)),
            eof_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks the follower to finish; it finalizes itself asynchronously.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// False once the follower has finalized.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Makes the follower drain to the next end-of-file and then stop.
    pub fn set_eof_shutdown(&self) {
        self.eof_shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    pub(crate) fn eof_shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.eof_shutdown)
    }
}

/// Map of live followers keyed by target path. Mutations are serialized by
/// an internal RW lock; concurrent reads are allowed.
#[derive(Debug, Default)]
pub struct FollowerPool {
    pool: RwLock<HashMap<PathBuf, FollowerHandle>>,
}

impl FollowerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: PathBuf, handle: FollowerHandle) {
        let mut pool = self.pool.write().expect("follower pool lock poisoned");
        pool.insert(path, handle);
    }

    pub fn remove(&self, path: &Path) {
        let mut pool = self.pool.write().expect("follower pool lock poisoned");
        pool.remove(path);
    }

    pub fn get(&self, path: &Path) -> Option<FollowerHandle> {
        let pool = self.pool.read().expect("follower pool lock poisoned");
        pool.get(path).cloned()
    }

    /// Copy of the current pool for iteration without holding the lock.
    pub fn snapshot(&self) -> Vec<(PathBuf, FollowerHandle)> {
        let pool = self.pool.read().expect("follower pool lock poisoned");
        pool.iter()
            .map(|(path, handle)| (path.clone(), handle.clone()))
            .collect()
    }
}
