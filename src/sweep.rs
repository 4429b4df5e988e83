//! Periodic expired-entry sweeper.
//!
//! Walks the counter store and response cache on a fixed interval and drops
//! entries whose retention has lapsed. The task is cancellable through the
//! shutdown broadcast and is idempotent: concurrent or repeated runs only
//! ever remove already-expired entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::store::CounterStore;

/// Spawns the background sweeper. The returned handle completes once the
/// shutdown signal is observed.
pub fn spawn_sweeper(
    store: Arc<dyn CounterStore>,
    cache: Arc<ResponseCache>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; harmless, since sweeping an
        // empty store is a no-op.
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.sweep().await {
                        Ok(removed) if removed > 0 => {
                            debug!(removed, "store sweep removed expired entries");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "store sweep failed"),
                    }
                    let removed = cache.sweep();
                    if removed > 0 {
                        debug!(removed, "cache sweep removed expired entries");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("sweeper stopping");
                    break;
                }
            }
        }
    })
}
