//! Persistence for per-key [`LimitState`].
//!
//! - [`MemoryStateStore`]: in-process, sharded map
//! - [`RedisStateStore`]: shared across instances, compare-and-set writes
//! - [`FallbackStateStore`]: prefers Redis and degrades to memory when it is unreachable

pub mod fallback;
pub mod memory;
pub mod redis;

use super::types::LimitState;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use self::fallback::FallbackStateStore;
pub use self::memory::MemoryStateStore;
pub use self::redis::RedisStateStore;

/// Blocked or idle entries are kept this long before cleanup removes them
pub const CLEANUP_GRACE: Duration = Duration::from_secs(3600);

/// Expiry of remote records, measured from the last write
pub const STATE_TTL: Duration = Duration::from_secs(3600);

/// Key to state mapping shared by every store implementation
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state for `key`, or a fresh state if none exists
    async fn load(&self, key: &str) -> Result<LimitState>;

    /// Persist `state` for `key`.
    ///
    /// Fails with [`crate::error::LimiterError::Conflict`] when the stored
    /// revision no longer matches `state.revision`.
    async fn save(&self, key: &str, state: &LimitState) -> Result<()>;

    /// Remove entries idle past the grace period, returning how many were removed
    async fn cleanup(&self, now: f64) -> Result<usize>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<()>;

    /// Backend currently serving requests
    fn name(&self) -> &'static str;
}
