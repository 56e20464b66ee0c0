use crate::error::{LimiterError, Result};
use crate::rate_limit::types::{BlockedReason, Decision};
use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Create a new metrics service and install it as the global recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            LimiterError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Build a service without installing a global recorder.
    ///
    /// Used by tests and by embedders that install their own recorder.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: Arc::new(recorder.handle()),
        }
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        describe_counter!(
            "safelimit_checks_total",
            "Total number of rate limit checks by policy and outcome"
        );
        describe_histogram!(
            "safelimit_check_duration_seconds",
            "Rate limit check latencies in seconds"
        );
        describe_counter!(
            "safelimit_escalations_total",
            "Total number of escalation transitions by policy and reason"
        );
        describe_counter!(
            "safelimit_store_fallback_transitions_total",
            "Total number of switches between the shared and local state store"
        );
        describe_counter!(
            "safelimit_audit_events_dropped_total",
            "Total number of audit events dropped because the queue was full"
        );
        describe_counter!(
            "safelimit_cleanup_evicted_total",
            "Total number of stale state entries evicted by cleanup"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Get the Prometheus metrics handle
    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Outcome label for a decision
fn outcome_label(decision: &Decision) -> &'static str {
    if decision.allowed {
        "allowed"
    } else if decision.child_safety_triggered {
        "child_safety"
    } else if decision.blocked_reason != BlockedReason::None {
        "blocked"
    } else {
        "denied"
    }
}

/// Record a completed check
pub fn record_check(policy: &str, decision: &Decision, duration: f64) {
    let labels = [
        ("policy", policy.to_string()),
        ("outcome", outcome_label(decision).to_string()),
    ];
    counter!("safelimit_checks_total", &labels).increment(1);

    let labels = [("policy", policy.to_string())];
    histogram!("safelimit_check_duration_seconds", &labels).record(duration);
}

/// Record an escalation transition
pub fn record_escalation(policy: &str, reason: &str) {
    let labels = [
        ("policy", policy.to_string()),
        ("reason", reason.to_string()),
    ];
    counter!("safelimit_escalations_total", &labels).increment(1);
}

/// Record a switch of the active state store ("redis" or "memory")
pub fn record_store_transition(to: &str) {
    let labels = [("to", to.to_string())];
    counter!("safelimit_store_fallback_transitions_total", &labels).increment(1);
}

/// Record an audit event dropped on a full queue
pub fn record_audit_dropped() {
    counter!("safelimit_audit_events_dropped_total").increment(1);
}

/// Record entries evicted by a cleanup sweep
pub fn record_cleanup(evicted: usize) {
    counter!("safelimit_cleanup_evicted_total").increment(evicted as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_label() {
        assert_eq!(outcome_label(&Decision::allowed(10, 9, 0.0)), "allowed");
        assert_eq!(outcome_label(&Decision::denied(10, 5.0, 5.0)), "denied");

        let blocked = Decision::blocked(10, 100.0, 0.0, BlockedReason::SuspiciousActivity);
        assert_eq!(outcome_label(&blocked), "blocked");

        let child = Decision::blocked(10, 100.0, 0.0, BlockedReason::ChildSafetyEscalation);
        assert_eq!(outcome_label(&child), "child_safety");
    }

    #[tokio::test]
    async fn test_metrics_service_creation() {
        // The recorder can only be installed once per process
        match MetricsService::new() {
            Ok(service) => {
                record_check("default", &Decision::allowed(10, 9, 0.0), 0.001);
                assert!(service.render().contains("safelimit_checks_total"));
            }
            Err(e) => {
                assert!(e.to_string().contains("recorder"));
            }
        }
    }

    #[test]
    fn test_detached_service_renders() {
        let service = MetricsService::detached();
        assert!(!service.render().contains("safelimit_checks_total"));
    }

    #[test]
    fn test_record_functions_dont_panic() {
        record_check("default", &Decision::denied(10, 5.0, 5.0), 0.002);
        record_escalation("child_interaction", "child_safety_escalation");
        record_store_transition("memory");
        record_audit_dropped();
        record_cleanup(3);
    }
}
