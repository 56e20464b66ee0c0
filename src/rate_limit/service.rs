use super::clock::{Clock, SystemClock};
use super::escalation::{EscalationHandler, EscalationOutcome, EscalationSettings};
use super::registry::PolicyRegistry;
use super::store::{FallbackStateStore, StateStore};
use super::strategy;
use super::types::{
    BlockedReason, CheckMetadata, Decision, EscalationLevel, LimitState, PolicyConfig,
    RateLimitKey,
};
use crate::audit::{AuditDispatcher, AuditEvent};
use crate::error::{LimiterError, Result};
use crate::metrics;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Number of key-shard locks serializing checks within one process
pub const KEY_LOCK_SHARDS: usize = 64;

/// Load/evaluate/save cycles attempted before a conflicting save is given up
pub const MAX_SAVE_ATTEMPTS: usize = 3;

/// Bounded set of async locks, one per key shard
struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[index].lock().await
    }
}

/// Rate limiter that resolves policies, evaluates state and applies escalation
pub struct RateLimiter {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn StateStore>,
    escalation: EscalationHandler,
    audit: AuditDispatcher,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(
        registry: Arc<PolicyRegistry>,
        store: Arc<dyn StateStore>,
        audit: AuditDispatcher,
    ) -> Self {
        info!(
            policies = registry.len(),
            store = store.name(),
            "Initializing rate limiter"
        );

        Self {
            registry,
            store,
            escalation: EscalationHandler::new(EscalationSettings::default(), audit.clone()),
            audit,
            clock: Arc::new(SystemClock::new()),
            locks: KeyLocks::new(KEY_LOCK_SHARDS),
        }
    }

    /// Create a rate limiter with local-only state and default policies
    pub fn local_only(registry: PolicyRegistry) -> Self {
        Self::new(
            Arc::new(registry),
            Arc::new(FallbackStateStore::local_only()),
            AuditDispatcher::default(),
        )
    }

    /// Use `clock` as the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the escalation heuristic
    pub fn with_escalation_settings(mut self, settings: EscalationSettings) -> Self {
        self.escalation = EscalationHandler::new(settings, self.audit.clone());
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditDispatcher {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check whether a request for `key` under `policy_name` is allowed.
    ///
    /// Only an unknown policy or a malformed key is an error; storage failures
    /// are absorbed and the decision is still returned.
    pub async fn check(
        &self,
        key: &RateLimitKey,
        policy_name: &str,
        metadata: &CheckMetadata,
    ) -> Result<Decision> {
        let started = Instant::now();
        let policy = self
            .registry
            .get_policy(policy_name)
            .ok_or_else(|| LimiterError::UnknownPolicy(policy_name.to_string()))?;
        key.validate()?;

        let storage_key = key.storage_key(&policy.name);
        let canonical = key.canonical();
        let _guard = self.locks.lock(&storage_key).await;

        let mut attempt = 0;
        let (decision, escalation) = loop {
            attempt += 1;
            let now = self.clock.now();
            let mut state = self.load_state(&storage_key).await;
            let (decision, escalation) = self.evaluate(policy, &mut state, now);

            match self.store.save(&storage_key, &state).await {
                Ok(()) => break (decision, escalation),
                Err(LimiterError::Conflict(_)) if attempt < MAX_SAVE_ATTEMPTS => {
                    debug!(key = %storage_key, attempt, "Concurrent update, retrying check");
                }
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Failed to persist rate limit state");
                    break (decision, escalation);
                }
            }
        };

        if let Some(escalation) = &escalation {
            self.escalation
                .publish(policy, &canonical, escalation, metadata);
        }

        self.audit
            .emit(AuditEvent::check(&policy.name, &canonical, &decision, metadata));
        metrics::record_check(&policy.name, &decision, started.elapsed().as_secs_f64());

        if decision.allowed {
            debug!(
                policy = %policy.name,
                key = %canonical,
                remaining = decision.remaining,
                "Rate limit check passed"
            );
        } else {
            warn!(
                policy = %policy.name,
                key = %canonical,
                reason = decision.blocked_reason.as_str(),
                child_safety = decision.child_safety_triggered,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn load_state(&self, key: &str) -> LimitState {
        match self.store.load(key).await {
            Ok(state) => state,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to load rate limit state, starting fresh");
                LimitState::default()
            }
        }
    }

    /// Apply one check to `state`
    fn evaluate(
        &self,
        policy: &PolicyConfig,
        state: &mut LimitState,
        now: f64,
    ) -> (Decision, Option<EscalationOutcome>) {
        let limit = policy.limit();
        state.total_requests += 1;

        if let Some(blocked_until) = state.blocked_until.filter(|until| *until > now) {
            return (
                Decision::blocked(limit, blocked_until, now, state.blocked_reason),
                None,
            );
        }

        let outcome = strategy::apply(policy, state, now);

        if outcome.allowed {
            if state.escalation != EscalationLevel::Normal || state.blocked_until.is_some() {
                debug!(policy = %policy.name, "Escalation cleared after expiry");
                state.escalation = EscalationLevel::Normal;
                state.blocked_until = None;
                state.blocked_reason = BlockedReason::None;
            }
            return (
                Decision::allowed(limit, outcome.remaining, outcome.reset_at),
                None,
            );
        }

        let escalation = self.escalation.evaluate(policy, state, now);
        let mut decision = Decision::denied(
            limit,
            outcome.reset_at,
            outcome.retry_after.unwrap_or_default(),
        );
        decision.blocked_reason = escalation.blocked_reason;
        decision.child_safety_triggered = escalation.child_safety_triggered;

        if let Some(blocked_until) = escalation.blocked_until.filter(|until| *until > now) {
            decision.reset_at = blocked_until;
            decision.retry_after_secs = Some(super::types::retry_after_secs(blocked_until - now));
        }

        (decision, Some(escalation))
    }
}
