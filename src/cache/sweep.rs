//! Periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::hybrid::HybridCache;
use super::response::ResponseCache;

/// Drop expired entries from every cache every `interval`.
///
/// Reads already discard expired entries lazily; the sweep reclaims the
/// capacity held by entries nobody reads again.
pub fn spawn_sweeper(
    interval: Duration,
    hybrid: HybridCache,
    responses: Arc<ResponseCache>,
) -> JoinHandle<()> {
    info!(interval = ?interval, "starting cache expiry sweeper");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let objects = hybrid.purge_expired().await;
            let pages = responses.purge_expired();
            if objects > 0 || pages > 0 {
                debug!(objects, pages, "swept expired cache entries");
            }
        }
    })
}
