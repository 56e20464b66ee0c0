//! Rate limiting module
//!
//! Policies are resolved by name from a [`PolicyRegistry`] and evaluated
//! against per-key state with one of three algorithms:
//!
//! - **Token Bucket**: Smooth rate limiting with burst support
//! - **Sliding Window**: Exact count over the trailing window
//! - **Fixed Window**: Counter reset at aligned window boundaries
//!
//! # Features
//!
//! - Typed keys scoped by child, user, IP, API key or route
//! - Escalation from flagged to blocked for child-safe policies and abusive keys
//! - Redis-backed state with graceful fallback to local memory
//! - Rate limit headers in responses (`X-RateLimit-*`)
//!
//! # Example
//!
//! ```rust,no_run
//! use safelimit::rate_limit::{CheckMetadata, PolicyRegistry, RateLimitKey, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::local_only(PolicyRegistry::with_defaults());
//!
//!     let decision = limiter
//!         .check(
//!             &RateLimitKey::child("42"),
//!             "child_interaction",
//!             &CheckMetadata::default(),
//!         )
//!         .await
//!         .unwrap();
//!     assert!(decision.allowed);
//! }
//! ```

pub mod cleanup;
pub mod clock;
pub mod escalation;
pub mod lua_scripts;
pub mod middleware;
pub mod registry;
pub mod service;
pub mod store;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use cleanup::CleanupScheduler;
pub use clock::{Clock, MockClock, SystemClock};
pub use escalation::{EscalationHandler, EscalationSettings};
pub use middleware::{
    add_rate_limit_headers, rate_limit_middleware, RateLimitMiddleware, RequestIdentity,
    RouteRule,
};
pub use registry::PolicyRegistry;
pub use service::RateLimiter;
pub use store::{FallbackStateStore, MemoryStateStore, RedisStateStore, StateStore};
pub use types::{
    BlockedReason, CheckMetadata, Decision, EscalationLevel, KeyScope, LimitState, PolicyConfig,
    RateLimitAlgorithm, RateLimitKey,
};
