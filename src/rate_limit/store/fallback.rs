use super::{MemoryStateStore, StateStore};
use crate::error::{LimiterError, Result};
use crate::metrics;
use crate::rate_limit::types::LimitState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default delay between reachability probes while degraded
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// State store that prefers a shared primary and falls back to local memory.
///
/// Every primary outage switches to the local store; while degraded the
/// primary is probed at most once per probe interval. Each switch is logged
/// once, in either direction.
pub struct FallbackStateStore {
    /// Shared store (optional)
    primary: Option<Arc<dyn StateStore>>,
    /// Local (in-memory) store
    local: MemoryStateStore,
    /// Whether to use the primary
    remote_available: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    probe_interval: Duration,
}

impl FallbackStateStore {
    /// Local-only store
    pub fn local_only() -> Self {
        info!("Initializing local-only state store");
        Self {
            primary: None,
            local: MemoryStateStore::new(),
            remote_available: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Store backed by `primary`, probed once before returning
    pub async fn with_primary(primary: Arc<dyn StateStore>, probe_interval: Duration) -> Self {
        info!(primary = primary.name(), "Initializing state store with shared backend");

        let store = Self {
            primary: Some(primary),
            local: MemoryStateStore::new(),
            remote_available: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            probe_interval,
        };
        store.probe().await;
        store
    }

    /// Whether the primary is currently serving requests
    pub fn is_remote_available(&self) -> bool {
        self.primary.is_some() && self.remote_available.load(Ordering::Acquire)
    }

    /// The local store
    pub fn local(&self) -> &MemoryStateStore {
        &self.local
    }

    /// Ping the primary and record the result
    pub async fn probe(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };

        self.touch_probe();
        match primary.ping().await {
            Ok(()) => {
                self.mark_available();
                true
            }
            Err(e) => {
                self.mark_unavailable(&e);
                false
            }
        }
    }

    /// Primary to use for this call, if any
    async fn active_primary(&self) -> Option<&Arc<dyn StateStore>> {
        let primary = self.primary.as_ref()?;

        if self.remote_available.load(Ordering::Acquire) {
            return Some(primary);
        }

        if self.probe_due() && self.probe().await {
            return Some(primary);
        }

        None
    }

    fn probe_due(&self) -> bool {
        let last_probe = self.last_probe.lock().unwrap_or_else(|e| e.into_inner());
        last_probe.map_or(true, |at| at.elapsed() >= self.probe_interval)
    }

    fn touch_probe(&self) {
        *self.last_probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn mark_available(&self) {
        if !self.remote_available.swap(true, Ordering::AcqRel) {
            info!("Shared state store reachable, using it as primary");
            metrics::record_store_transition("redis");
        }
    }

    fn mark_unavailable(&self, err: &LimiterError) {
        self.touch_probe();
        if self.remote_available.swap(false, Ordering::AcqRel) {
            warn!(error = %err, "Shared state store unavailable, falling back to local store");
            metrics::record_store_transition("memory");
        } else {
            debug!(error = %err, "Shared state store still unavailable");
        }
    }
}

#[async_trait]
impl StateStore for FallbackStateStore {
    async fn load(&self, key: &str) -> Result<LimitState> {
        if let Some(primary) = self.active_primary().await {
            match primary.load(key).await {
                Ok(state) => return Ok(state),
                Err(LimiterError::Serialization(e)) => {
                    // The next save overwrites the unreadable record
                    warn!(key = %key, error = %e, "Unreadable state record, starting fresh");
                    return Ok(LimitState::default());
                }
                Err(e @ LimiterError::StoreUnavailable(_)) => self.mark_unavailable(&e),
                Err(e) => return Err(e),
            }
        }

        self.local.load(key).await
    }

    async fn save(&self, key: &str, state: &LimitState) -> Result<()> {
        if let Some(primary) = self.active_primary().await {
            match primary.save(key, state).await {
                Ok(()) => return Ok(()),
                Err(e @ LimiterError::StoreUnavailable(_)) => self.mark_unavailable(&e),
                Err(e) => return Err(e),
            }
            // State loaded from the primary carries its revision, not ours
            self.local.put(key, state);
            return Ok(());
        }

        self.local.save(key, state).await
    }

    async fn cleanup(&self, now: f64) -> Result<usize> {
        let mut removed = self.local.cleanup(now).await?;

        if let Some(primary) = self.active_primary().await {
            match primary.cleanup(now).await {
                Ok(count) => removed += count,
                Err(e @ LimiterError::StoreUnavailable(_)) => self.mark_unavailable(&e),
                Err(e) => warn!(error = %e, "Shared state store cleanup failed"),
            }
        }

        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.probe().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        if self.is_remote_available() {
            self.primary.as_ref().map_or("memory", |p| p.name())
        } else {
            self.local.name()
        }
    }
}
