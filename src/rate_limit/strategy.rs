//! Rate limiting algorithms.
//!
//! Each function evaluates a single request against a policy and a state
//! snapshot, updating the state in place. They are deterministic given
//! `(policy, state, now)` and never touch storage or the clock.

use super::types::{LimitState, PolicyConfig, RateLimitAlgorithm};

/// Slack for floating point refill arithmetic; a bucket this close to one
/// token counts as holding one.
const TOKEN_EPSILON: f64 = 1e-9;

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub allowed: bool,
    pub remaining: u32,
    /// When the window or bucket is fully available again
    pub reset_at: f64,
    /// Seconds until a retry could succeed (denials only)
    pub retry_after: Option<f64>,
}

impl StrategyOutcome {
    fn allow(remaining: u32, reset_at: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    fn deny(reset_at: f64, retry_after: f64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after.max(0.0)),
        }
    }
}

/// Evaluate a request with the policy's algorithm
pub fn apply(policy: &PolicyConfig, state: &mut LimitState, now: f64) -> StrategyOutcome {
    match policy.algorithm {
        RateLimitAlgorithm::FixedWindow => fixed_window(policy, state, now),
        RateLimitAlgorithm::SlidingWindow => sliding_window(policy, state, now),
        RateLimitAlgorithm::TokenBucket => token_bucket(policy, state, now),
    }
}

/// Fixed window: the request log is reset whenever a new window begins.
pub fn fixed_window(policy: &PolicyConfig, state: &mut LimitState, now: f64) -> StrategyOutcome {
    let window = policy.window_secs as f64;
    let window_start = (now / window).floor() * window;
    let reset_at = window_start + window;

    if state.window_start != Some(window_start) {
        state.request_timestamps.clear();
        state.window_start = Some(window_start);
    }
    state.request_timestamps.retain(|t| *t >= window_start);

    let count = state.request_timestamps.len() as u32;
    if count >= policy.max_requests {
        return StrategyOutcome::deny(reset_at, reset_at - now);
    }

    state.request_timestamps.push(now);
    StrategyOutcome::allow(policy.max_requests - count - 1, reset_at)
}

/// Sliding window: only requests within the trailing window are counted.
pub fn sliding_window(policy: &PolicyConfig, state: &mut LimitState, now: f64) -> StrategyOutcome {
    let window = policy.window_secs as f64;
    let cutoff = now - window;
    state.request_timestamps.retain(|t| *t > cutoff);

    let count = state.request_timestamps.len() as u32;
    if count >= policy.max_requests {
        let oldest = oldest(&state.request_timestamps).unwrap_or(now);
        return StrategyOutcome::deny(oldest + window, oldest + window - now);
    }

    state.request_timestamps.push(now);
    let oldest = oldest(&state.request_timestamps).unwrap_or(now);
    StrategyOutcome::allow(policy.max_requests - count - 1, oldest + window)
}

/// Token bucket: tokens refill continuously up to the burst capacity.
///
/// A state that has never been refilled starts with a full bucket.
pub fn token_bucket(policy: &PolicyConfig, state: &mut LimitState, now: f64) -> StrategyOutcome {
    let capacity = policy.burst_size() as f64;
    let rate = policy.refill_rate();

    let (tokens, last_refill) = match state.last_refill {
        Some(last) => (state.tokens, last),
        None => (capacity, now),
    };

    let elapsed = (now - last_refill).max(0.0);
    let mut tokens = (tokens + elapsed * rate).min(capacity);
    state.last_refill = Some(now);

    if tokens + TOKEN_EPSILON >= 1.0 {
        tokens = (tokens - 1.0).max(0.0);
        state.tokens = tokens;
        let reset_at = now + (capacity - tokens) / rate;
        return StrategyOutcome::allow(tokens.floor() as u32, reset_at);
    }

    state.tokens = tokens;
    let reset_at = now + (capacity - tokens) / rate;
    StrategyOutcome::deny(reset_at, (1.0 - tokens) / rate)
}

fn oldest(timestamps: &[f64]) -> Option<f64> {
    timestamps.iter().copied().reduce(f64::min)
}
