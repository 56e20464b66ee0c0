//! Escalation of denied requests into blocks.
//!
//! Each key moves between three levels:
//!
//! ```text
//!   Normal --(denied under child-safe policy)--> Flagged
//!   Normal --(> multiplier x max_requests denials in window)--> Blocked
//!   Flagged/Blocked --(block_duration_secs > 0)--> Blocked
//!   Blocked --(block expired, next allowed check)--> Normal
//! ```
//!
//! The handler only runs for requests the strategy engine already denied.

use super::types::{BlockedReason, CheckMetadata, EscalationLevel, LimitState, PolicyConfig};
use crate::audit::{AuditDispatcher, AuditEvent};
use crate::metrics;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Tunables of the suspicious activity heuristic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EscalationSettings {
    /// Denials allowed per `max_requests` before a key is blocked
    #[serde(default = "default_denial_multiplier")]
    pub denial_multiplier: u32,
    /// Trailing window over which denials are counted
    #[serde(default = "default_denial_window")]
    pub denial_window_secs: u64,
}

fn default_denial_multiplier() -> u32 {
    3
}

fn default_denial_window() -> u64 {
    300
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            denial_multiplier: default_denial_multiplier(),
            denial_window_secs: default_denial_window(),
        }
    }
}

/// A change of escalation level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationTransition {
    pub from: EscalationLevel,
    pub to: EscalationLevel,
    pub reason: BlockedReason,
    pub blocked_until: Option<f64>,
}

/// What the handler decided for one denial
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EscalationOutcome {
    pub blocked_reason: BlockedReason,
    pub child_safety_triggered: bool,
    /// New block, if one was applied
    pub blocked_until: Option<f64>,
    pub transitions: Vec<EscalationTransition>,
}

/// Child-safety aware escalation policy
#[derive(Debug, Clone)]
pub struct EscalationHandler {
    settings: EscalationSettings,
    audit: AuditDispatcher,
}

impl EscalationHandler {
    pub fn new(settings: EscalationSettings, audit: AuditDispatcher) -> Self {
        Self { settings, audit }
    }

    pub fn settings(&self) -> &EscalationSettings {
        &self.settings
    }

    /// Evaluate a denial and update the key's escalation state
    pub fn evaluate(
        &self,
        policy: &PolicyConfig,
        state: &mut LimitState,
        now: f64,
    ) -> EscalationOutcome {
        let cutoff = now - self.settings.denial_window_secs as f64;
        state.denials.retain(|t| *t > cutoff);
        state.denials.push(now);

        let threshold =
            u64::from(self.settings.denial_multiplier) * u64::from(policy.max_requests);
        let suspicious = state.denials.len() as u64 > threshold;

        // Only `threshold + 1` denials are ever needed to decide
        let cap = usize::try_from(threshold.saturating_add(1)).unwrap_or(usize::MAX);
        if state.denials.len() > cap {
            let excess = state.denials.len() - cap;
            state.denials.drain(..excess);
        }

        let reason = if policy.child_safe_mode {
            BlockedReason::ChildSafetyEscalation
        } else if suspicious {
            BlockedReason::SuspiciousActivity
        } else {
            return EscalationOutcome::default();
        };

        let mut outcome = EscalationOutcome {
            blocked_reason: reason,
            child_safety_triggered: policy.child_safe_mode,
            ..Default::default()
        };

        if policy.child_safe_mode && state.escalation == EscalationLevel::Normal {
            outcome.transitions.push(EscalationTransition {
                from: EscalationLevel::Normal,
                to: EscalationLevel::Flagged,
                reason,
                blocked_until: None,
            });
            state.escalation = EscalationLevel::Flagged;
        }

        if policy.block_duration_secs > 0 {
            let blocked_until = now + policy.block_duration_secs as f64;
            outcome.transitions.push(EscalationTransition {
                from: state.escalation,
                to: EscalationLevel::Blocked,
                reason,
                blocked_until: Some(blocked_until),
            });
            state.escalation = EscalationLevel::Blocked;
            state.blocked_until = Some(blocked_until);
            state.blocked_reason = reason;
            outcome.blocked_until = Some(blocked_until);
        } else if !policy.child_safe_mode {
            // No block to apply: mark the key once, later denials are plain
            if state.escalation == EscalationLevel::Blocked {
                return EscalationOutcome::default();
            }
            outcome.transitions.push(EscalationTransition {
                from: state.escalation,
                to: EscalationLevel::Blocked,
                reason,
                blocked_until: None,
            });
            state.escalation = EscalationLevel::Blocked;
            state.blocked_reason = reason;
        }

        outcome
    }

    /// Emit one audit event per transition in `outcome`
    pub fn publish(
        &self,
        policy: &PolicyConfig,
        key: &str,
        outcome: &EscalationOutcome,
        metadata: &CheckMetadata,
    ) {
        for transition in &outcome.transitions {
            match transition.to {
                EscalationLevel::Blocked => warn!(
                    policy = %policy.name,
                    key = %key,
                    reason = transition.reason.as_str(),
                    blocked_until = ?transition.blocked_until,
                    "Key blocked"
                ),
                _ => info!(
                    policy = %policy.name,
                    key = %key,
                    reason = transition.reason.as_str(),
                    "Key flagged"
                ),
            }

            metrics::record_escalation(&policy.name, transition.reason.as_str());
            self.audit
                .emit(AuditEvent::escalation(&policy.name, key, transition, metadata));
        }
    }
}
