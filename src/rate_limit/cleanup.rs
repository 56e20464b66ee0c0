use super::clock::Clock;
use super::store::StateStore;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between cleanup sweeps
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically evicts stale entries from a state store
pub struct CleanupScheduler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// Run a single sweep, returning the number of evicted entries
    pub async fn run_once(&self) -> usize {
        let now = self.clock.now();
        match self.store.cleanup(now).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, store = self.store.name(), "Evicted stale rate limit state");
                } else {
                    debug!(store = self.store.name(), "No stale rate limit state to evict");
                }
                metrics::record_cleanup(removed);
                removed
            }
            Err(e) => {
                warn!(error = %e, "Rate limit state cleanup failed");
                0
            }
        }
    }

    /// Start sweeping in the background
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                interval_secs = self.interval.as_secs(),
                "Starting rate limit state cleanup"
            );

            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
