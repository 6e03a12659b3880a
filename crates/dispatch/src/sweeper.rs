//! Periodic purge of expired cache entries.
//!
//! Expired entries are already invisible to readers; sweeping only gives
//! their memory back before LRU eviction would.

use std::sync::Arc;
use std::time::Duration;

use jobgate_core::cache::BoundedCache;
use tokio_util::sync::CancellationToken;

/// Run the sweep loop until `cancel` is triggered.
pub async fn run_cache_sweeper<V: Clone + Send>(
    cache: Arc<BoundedCache<V>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Cache sweeper started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Cache sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::info!(
                        purged,
                        remaining = cache.size(),
                        "Cache sweeper: purged expired entries",
                    );
                } else {
                    tracing::debug!("Cache sweeper: nothing to purge");
                }
            }
        }
    }
}
