//! Periodic refresh driver for components that pull external state.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A component whose state can be refreshed from an external source: the
/// rate policy (rules file), the services providers (cluster or file) and
/// the metrics collector (periodic reset).
#[async_trait]
pub trait Retrieve: Send + Sync {
    async fn retrieve(&self) -> anyhow::Result<()>;
}

/// Refreshes `retriever` immediately and then on every `interval` tick until
/// the token is cancelled. Failures are logged and do not stop the loop.
pub async fn retrieve_periodic(
    token: CancellationToken,
    retriever: Arc<dyn Retrieve>,
    interval: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(error) = retriever.retrieve().await {
                    warn!(message = "Periodic retrieve failed.", %error);
                }
            }
        }
    }
}
