use super::{StateStore, CLEANUP_GRACE};
use crate::error::{LimiterError, Result};
use crate::rate_limit::types::LimitState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Local (in-memory) state store.
///
/// Backed by a sharded map, so unrelated keys never wait on one global lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    states: Arc<DashMap<String, LimitState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` unconditionally, bumping its revision
    pub fn put(&self, key: &str, state: &LimitState) {
        let mut next = state.clone();
        next.revision = state.revision + 1;
        self.states.insert(key.to_string(), next);
    }

    /// Get the number of tracked keys (for testing/monitoring)
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<LimitState> {
        Ok(self
            .states
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, key: &str, state: &LimitState) -> Result<()> {
        let mut entry = self.states.entry(key.to_string()).or_default();
        if entry.revision != state.revision {
            return Err(LimiterError::Conflict(key.to_string()));
        }

        let mut next = state.clone();
        next.revision = state.revision + 1;
        *entry = next;
        Ok(())
    }

    async fn cleanup(&self, now: f64) -> Result<usize> {
        // Collect first so no shard stays locked while entries are removed
        let candidates: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.value().is_stale(now, CLEANUP_GRACE))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            if self
                .states
                .remove_if(&key, |_, state| state.is_stale(now, CLEANUP_GRACE))
                .is_some()
            {
                removed += 1;
            }
        }

        debug!(removed, remaining = self.states.len(), "Memory store cleanup");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_key_returns_fresh_state() {
        let store = MemoryStateStore::new();
        let state = store.load("default:ip:192.168.1.1").await.unwrap();
        assert_eq!(state, LimitState::default());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStateStore::new();
        let state = LimitState {
            request_timestamps: vec![1.0, 2.0],
            total_requests: 2,
            ..Default::default()
        };

        store.save("k", &state).await.unwrap();
        let loaded = store.load("k").await.unwrap();

        assert_eq!(loaded.request_timestamps, vec![1.0, 2.0]);
        assert_eq!(loaded.revision, 1);
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = MemoryStateStore::new();
        let first = store.load("k").await.unwrap();
        let second = store.load("k").await.unwrap();

        store.save("k", &first).await.unwrap();
        let err = store.save("k", &second).await.unwrap_err();
        assert!(matches!(err, LimiterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_put_ignores_revision() {
        let store = MemoryStateStore::new();
        store.put("k", &LimitState::default());
        store.put("k", &LimitState::default());
        assert_eq!(store.load("k").await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_stale_entries() {
        let store = MemoryStateStore::new();
        let grace = CLEANUP_GRACE.as_secs_f64();

        let blocked = LimitState {
            request_timestamps: vec![10.0],
            blocked_until: Some(100.0),
            ..Default::default()
        };
        let active = LimitState {
            request_timestamps: vec![10.0, 150.0 + grace],
            ..Default::default()
        };
        let idle = LimitState {
            request_timestamps: vec![10.0],
            ..Default::default()
        };

        store.put("blocked", &blocked);
        store.put("active", &active);
        store.put("idle", &idle);

        // Block ended at 100, so it is stale only once 100 + grace has passed
        let removed = store.cleanup(99.0 + grace).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.states.contains_key("blocked"));

        let removed = store.cleanup(100.0 + grace).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.states.contains_key("active"));
    }
}
