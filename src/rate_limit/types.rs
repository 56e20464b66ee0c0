use crate::error::{LimiterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Longest identifier accepted in a rate limit key
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Counter reset at fixed window boundaries (simpler, less accurate)
    FixedWindow,
    /// Log of request timestamps over a trailing window (more accurate)
    SlidingWindow,
    /// Token bucket (smooth rate limiting with burst support)
    TokenBucket,
}

impl RateLimitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::FixedWindow => "fixed_window",
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::TokenBucket => "token_bucket",
        }
    }
}

/// A named, immutable rate limit policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Policy name (e.g. "child_interaction", "auth_login")
    pub name: String,
    /// Algorithm used to evaluate requests
    pub algorithm: RateLimitAlgorithm,
    /// Maximum number of requests allowed per window
    pub max_requests: u32,
    /// Time window for the limit (in seconds, unused by the token bucket)
    #[serde(default)]
    pub window_secs: u64,
    /// Token bucket capacity (defaults to `max_requests`)
    #[serde(default)]
    pub burst_capacity: Option<u32>,
    /// Token bucket refill rate (defaults to `max_requests / window_secs`)
    #[serde(default)]
    pub refill_rate_per_sec: Option<f64>,
    /// Block applied once a violation is escalated
    #[serde(default)]
    pub block_duration_secs: u64,
    /// Escalate every violation, regardless of frequency
    #[serde(default)]
    pub child_safe_mode: bool,
}

impl PolicyConfig {
    /// Create a fixed window policy
    pub fn fixed_window(name: impl Into<String>, max_requests: u32, window_secs: u64) -> Self {
        Self::windowed(name, RateLimitAlgorithm::FixedWindow, max_requests, window_secs)
    }

    /// Create a sliding window policy
    pub fn sliding_window(name: impl Into<String>, max_requests: u32, window_secs: u64) -> Self {
        Self::windowed(
            name,
            RateLimitAlgorithm::SlidingWindow,
            max_requests,
            window_secs,
        )
    }

    /// Create a token bucket policy
    pub fn token_bucket(name: impl Into<String>, burst_capacity: u32, refill_rate_per_sec: f64) -> Self {
        Self {
            name: name.into(),
            algorithm: RateLimitAlgorithm::TokenBucket,
            max_requests: burst_capacity,
            window_secs: 0,
            burst_capacity: Some(burst_capacity),
            refill_rate_per_sec: Some(refill_rate_per_sec),
            block_duration_secs: 0,
            child_safe_mode: false,
        }
    }

    fn windowed(
        name: impl Into<String>,
        algorithm: RateLimitAlgorithm,
        max_requests: u32,
        window_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm,
            max_requests,
            window_secs,
            burst_capacity: None,
            refill_rate_per_sec: None,
            block_duration_secs: 0,
            child_safe_mode: false,
        }
    }

    /// Set the block duration applied on escalation
    pub fn with_block_duration(mut self, secs: u64) -> Self {
        self.block_duration_secs = secs;
        self
    }

    /// Enable child-safe mode
    pub fn child_safe(mut self) -> Self {
        self.child_safe_mode = true;
        self
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Get the bucket capacity (defaults to requests if not specified)
    pub fn burst_size(&self) -> u32 {
        self.burst_capacity.unwrap_or(self.max_requests)
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        match self.refill_rate_per_sec {
            Some(rate) => rate,
            None if self.window_secs > 0 => self.max_requests as f64 / self.window_secs as f64,
            None => 0.0,
        }
    }

    /// Limit advertised to clients
    pub fn limit(&self) -> u32 {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => self.burst_size(),
            _ => self.max_requests,
        }
    }

    /// Reject non-positive thresholds
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LimiterError::Validation(
                "Policy name cannot be empty".to_string(),
            ));
        }

        if self.max_requests == 0 {
            return Err(LimiterError::Validation(format!(
                "max_requests must be > 0 for policy: {}",
                self.name
            )));
        }

        match self.algorithm {
            RateLimitAlgorithm::FixedWindow | RateLimitAlgorithm::SlidingWindow => {
                if self.window_secs == 0 {
                    return Err(LimiterError::Validation(format!(
                        "window_secs must be > 0 for policy: {}",
                        self.name
                    )));
                }
            }
            RateLimitAlgorithm::TokenBucket => {
                if self.burst_size() == 0 {
                    return Err(LimiterError::Validation(format!(
                        "burst_capacity must be > 0 for policy: {}",
                        self.name
                    )));
                }
                let rate = self.refill_rate();
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(LimiterError::Validation(format!(
                        "refill_rate_per_sec must be > 0 for policy: {}",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Why a key is currently being denied beyond its plain limit
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    #[default]
    None,
    SuspiciousActivity,
    ChildSafetyEscalation,
}

impl BlockedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedReason::None => "none",
            BlockedReason::SuspiciousActivity => "suspicious_activity",
            BlockedReason::ChildSafetyEscalation => "child_safety_escalation",
        }
    }
}

/// Escalation level of a key
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    #[default]
    Normal,
    Flagged,
    Blocked,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::Normal => "normal",
            EscalationLevel::Flagged => "flagged",
            EscalationLevel::Blocked => "blocked",
        }
    }
}

/// Per-key rate limit state, persisted between checks
///
/// Timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitState {
    /// Accepted requests, in arrival order (window algorithms)
    #[serde(default)]
    pub request_timestamps: Vec<f64>,
    /// Start of the last fixed window seen
    #[serde(default)]
    pub window_start: Option<f64>,
    /// Tokens left in the bucket
    #[serde(default)]
    pub tokens: f64,
    /// Last time the bucket was refilled; `None` means a full bucket
    #[serde(default)]
    pub last_refill: Option<f64>,
    /// Every check is denied until this instant
    #[serde(default)]
    pub blocked_until: Option<f64>,
    /// Reason recorded with the active block
    #[serde(default)]
    pub blocked_reason: BlockedReason,
    /// Current escalation level
    #[serde(default)]
    pub escalation: EscalationLevel,
    /// Recent denials feeding the suspicious activity heuristic
    #[serde(default)]
    pub denials: Vec<f64>,
    /// Total checks ever made against this key
    #[serde(default)]
    pub total_requests: u64,
    /// Incremented on every successful save
    #[serde(default)]
    pub revision: u64,
}

impl LimitState {
    /// Whether an active block denies checks at `now`
    pub fn is_blocked(&self, now: f64) -> bool {
        self.blocked_until.map_or(false, |until| until > now)
    }

    /// Most recent instant this state was touched
    pub fn last_activity(&self) -> Option<f64> {
        [
            self.request_timestamps.last().copied(),
            self.last_refill,
            self.denials.last().copied(),
            self.blocked_until,
        ]
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
    }

    /// Whether the state can be evicted at `now`
    pub fn is_stale(&self, now: f64, grace: Duration) -> bool {
        match self.last_activity() {
            Some(last) => last + grace.as_secs_f64() <= now,
            None => true,
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Total limit
    pub limit: u32,
    /// Remaining requests in the current window or bucket
    pub remaining: u32,
    /// When the window or bucket is fully available again (epoch seconds)
    pub reset_at: f64,
    /// Retry after duration (for 429 responses)
    pub retry_after_secs: Option<u64>,
    /// Why the key is blocked, if it is
    pub blocked_reason: BlockedReason,
    /// Whether child-safety enforcement kicked in
    pub child_safety_triggered: bool,
}

impl Decision {
    /// Create an allowed decision
    pub fn allowed(limit: u32, remaining: u32, reset_at: f64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after_secs: None,
            blocked_reason: BlockedReason::None,
            child_safety_triggered: false,
        }
    }

    /// Create a denied decision
    pub fn denied(limit: u32, reset_at: f64, retry_after: f64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after_secs: Some(retry_after_secs(retry_after)),
            blocked_reason: BlockedReason::None,
            child_safety_triggered: false,
        }
    }

    /// Create a decision for a key under an active block
    pub fn blocked(limit: u32, blocked_until: f64, now: f64, reason: BlockedReason) -> Self {
        Self {
            blocked_reason: reason,
            child_safety_triggered: reason == BlockedReason::ChildSafetyEscalation,
            ..Self::denied(limit, blocked_until, blocked_until - now)
        }
    }
}

/// Round a retry delay up to whole seconds, never below one
pub fn retry_after_secs(secs: f64) -> u64 {
    if secs.is_finite() && secs > 1.0 {
        secs.ceil() as u64
    } else {
        1
    }
}

/// What a rate limit key identifies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// A child profile id
    Child,
    /// An authenticated user id
    User,
    /// A client IP address
    Ip,
    /// An API key
    #[serde(rename = "apikey", alias = "api_key")]
    ApiKey,
    /// A route path
    Route,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Child => "child",
            KeyScope::User => "user",
            KeyScope::Ip => "ip",
            KeyScope::ApiKey => "apikey",
            KeyScope::Route => "route",
        }
    }
}

impl FromStr for KeyScope {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "child" => Ok(KeyScope::Child),
            "user" => Ok(KeyScope::User),
            "ip" => Ok(KeyScope::Ip),
            "apikey" => Ok(KeyScope::ApiKey),
            "route" => Ok(KeyScope::Route),
            other => Err(LimiterError::Validation(format!(
                "Unknown key scope: {}",
                other
            ))),
        }
    }
}

/// Rate limit key components
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// What the identifier refers to
    pub scope: KeyScope,
    /// The identifier (e.g., child id, IP address, user id)
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a new rate limit key
    pub fn new(scope: KeyScope, identifier: impl Into<String>) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
        }
    }

    pub fn child(id: impl Into<String>) -> Self {
        Self::new(KeyScope::Child, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(KeyScope::User, id)
    }

    pub fn ip(addr: impl Into<String>) -> Self {
        Self::new(KeyScope::Ip, addr)
    }

    /// Reject identifiers that could collide with or corrupt other keys
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(LimiterError::Validation(format!(
                "Empty identifier for {} key",
                self.scope.as_str()
            )));
        }
        if self.identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(LimiterError::Validation(format!(
                "Identifier for {} key exceeds {} bytes",
                self.scope.as_str(),
                MAX_IDENTIFIER_LEN
            )));
        }
        if self
            .identifier
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(LimiterError::Validation(format!(
                "Identifier for {} key contains whitespace or control characters",
                self.scope.as_str()
            )));
        }
        Ok(())
    }

    /// Canonical form, e.g. `child:42`
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.scope.as_str(), self.identifier)
    }

    /// Key under which state for `policy` is stored
    pub fn storage_key(&self, policy: &str) -> String {
        format!("{}:{}", policy, self.canonical())
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for RateLimitKey {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        let (scope, identifier) = s.split_once(':').ok_or_else(|| {
            LimiterError::Validation(format!("Key must look like <scope>:<id>, got: {}", s))
        })?;
        let key = RateLimitKey::new(scope.parse()?, identifier);
        key.validate()?;
        Ok(key)
    }
}

/// Caller-supplied identifiers forwarded untouched to the audit sink
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_key_forms() {
        let key = RateLimitKey::child("42");
        assert_eq!(key.canonical(), "child:42");
        assert_eq!(key.to_string(), "child:42");
        assert_eq!(
            key.storage_key("child_interaction"),
            "child_interaction:child:42"
        );
    }

    #[test]
    fn test_rate_limit_key_parse() {
        let key: RateLimitKey = "ip:192.168.1.1".parse().unwrap();
        assert_eq!(key.scope, KeyScope::Ip);
        assert_eq!(key.identifier, "192.168.1.1");

        assert!("192.168.1.1".parse::<RateLimitKey>().is_err());
        assert!("planet:earth".parse::<RateLimitKey>().is_err());
        assert!("user:".parse::<RateLimitKey>().is_err());
    }

    #[test]
    fn test_rate_limit_key_validation() {
        assert!(RateLimitKey::user("user123").validate().is_ok());
        assert!(RateLimitKey::user("user 123").validate().is_err());
        assert!(RateLimitKey::user("a".repeat(MAX_IDENTIFIER_LEN + 1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_scopes_do_not_collide() {
        let a = RateLimitKey::user("42").storage_key("default");
        let b = RateLimitKey::child("42").storage_key("default");
        let c = RateLimitKey::child("42").storage_key("child_interaction");
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = PolicyConfig::sliding_window("default", 100, 60);
        assert_eq!(policy.burst_size(), 100);
        assert_eq!(policy.window(), Duration::from_secs(60));
        assert!((policy.refill_rate() - 100.0 / 60.0).abs() < f64::EPSILON);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_validation() {
        assert!(PolicyConfig::sliding_window("p", 0, 60).validate().is_err());
        assert!(PolicyConfig::fixed_window("p", 5, 0).validate().is_err());
        assert!(PolicyConfig::token_bucket("p", 10, 0.0).validate().is_err());
        assert!(PolicyConfig::token_bucket("p", 0, 1.0).validate().is_err());
        assert!(PolicyConfig::token_bucket("p", 10, 0.5).validate().is_ok());
        assert!(PolicyConfig::sliding_window(" ", 1, 1).validate().is_err());
    }

    #[test]
    fn test_policy_yaml() {
        let yaml = r#"
name: child_interaction
algorithm: sliding_window
max_requests: 30
window_secs: 60
block_duration_secs: 3600
child_safe_mode: true
"#;
        let policy: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.algorithm, RateLimitAlgorithm::SlidingWindow);
        assert!(policy.child_safe_mode);
        assert_eq!(policy.block_duration_secs, 3600);
    }

    #[test]
    fn test_decision_constructors() {
        let allowed = Decision::allowed(100, 50, 30.0);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 50);
        assert_eq!(allowed.retry_after_secs, None);

        let denied = Decision::denied(100, 30.0, 29.2);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs, Some(30));

        let blocked = Decision::blocked(10, 100.0, 40.0, BlockedReason::ChildSafetyEscalation);
        assert!(blocked.child_safety_triggered);
        assert_eq!(blocked.retry_after_secs, Some(60));
        assert_eq!(blocked.reset_at, 100.0);
    }

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_secs(0.0), 1);
        assert_eq!(retry_after_secs(0.3), 1);
        assert_eq!(retry_after_secs(1.0), 1);
        assert_eq!(retry_after_secs(1.01), 2);
        assert_eq!(retry_after_secs(f64::NAN), 1);
    }

    #[test]
    fn test_state_staleness() {
        let grace = Duration::from_secs(3600);
        let empty = LimitState::default();
        assert!(empty.is_stale(0.0, grace));

        let state = LimitState {
            request_timestamps: vec![100.0],
            blocked_until: Some(500.0),
            ..Default::default()
        };
        assert_eq!(state.last_activity(), Some(500.0));
        assert!(!state.is_stale(4000.0, grace));
        assert!(state.is_stale(4100.0, grace));
        assert!(state.is_blocked(499.0));
        assert!(!state.is_blocked(500.0));
    }

    #[test]
    fn test_state_deserializes_minimal_record() {
        let json = r#"{"request_timestamps":[1.5,2.5],"tokens":0.0,"last_refill":null,"blocked_until":null,"total_requests":2}"#;
        let state: LimitState = serde_json::from_str(json).unwrap();
        assert_eq!(state.request_timestamps, vec![1.5, 2.5]);
        assert_eq!(state.escalation, EscalationLevel::Normal);
        assert_eq!(state.revision, 0);
    }
}
