//! Staged pipeline: parse → SLI observe → filter → marshal → transport.
//!
//! Every stage runs [`PARALLELISM`] workers over a shared bounded input
//! channel. Workers share no mutable state; ordering across workers within
//! a stage is not guaranteed, per-follower ordering into the parse stage is.
//! A stage's output closes once all of its workers have finished, so
//! channel closure propagates leaf to root on shutdown.

mod filter;
mod marshal;
mod parse;
mod sli;
mod transport;

use std::future::Future;

use tokio_util::task::TaskTracker;

pub use filter::FilterStage;
pub use marshal::MarshalStage;
pub use parse::ParseStage;
pub use sli::SliStage;
pub use transport::{SLEEP_TRANSPORT_UNAVAILABLE, TransportStage};

/// Count of workers each stage runs.
pub const PARALLELISM: usize = 8;

pub(crate) fn spawn_workers<S, F, Fut>(tracker: &TaskTracker, parallelism: usize, stage: S, run: F)
where
    S: Clone + Send + 'static,
    F: Fn(S) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    for _ in 0..parallelism {
        tracker.spawn(run(stage.clone()));
    }
}
