//! Background expiry of assumed state.
//!
//! Reads already ignore expired assumptions; the sweep reclaims them.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Cache;

/// Interval between sweeps.
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(1);

/// Spawn the sweep. It stops when `cancel` fires or the cache is dropped.
pub(super) fn spawn_cleanup_task(cache: Weak<Cache>, cancel: CancellationToken, period: Duration) {
    tokio::spawn(async move {
        run_cleanup_loop(cache, cancel, period).await;
    });
}

async fn run_cleanup_loop(cache: Weak<Cache>, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Assumption cleanup task shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let expired = cache.cleanup_expired();
                if expired > 0 {
                    debug!(expired, "Cleaned up expired assumptions");
                }
            }
        }
    }
}
