//! # Background Sweeper
//!
//! Periodically reclaims expired idempotency records so the store's memory
//! use stays bounded, independent of request traffic. Mirrors the store's
//! sweep contract: reservations are never touched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::store::IdempotencyStore;

/// Handle to a running sweeper task. Dropping the handle also stops the
/// sweeper, so a forgotten handle cannot leak the task.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
}

impl SweeperHandle {
    /// Stops the sweeper. Idempotent; safe to call during shutdown.
    pub fn stop(self) {
        let _ = self.stop.send(true);
    }
}

/// Spawns a sweep loop over `store`, ticking every `interval`.
pub fn start<S>(store: Arc<S>, interval: Duration) -> SweeperHandle
where
    S: IdempotencyStore + ?Sized + 'static,
{
    let (stop, mut stopped) = watch::channel(false);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep_expired();
                }
                // Err means the handle was dropped; either way, stop.
                _ = stopped.changed() => break,
            }
        }
        tracing::debug!("sweeper stopped");
    });

    SweeperHandle { stop }
}
