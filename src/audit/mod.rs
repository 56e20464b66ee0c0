//! Audit events emitted by the limiter.
//!
//! The limiter never writes audit records itself. It pushes [`AuditEvent`]s
//! onto an [`AuditDispatcher`], a bounded queue drained by a dedicated worker
//! task that hands each event to an [`AuditSink`]. When the queue is full the
//! oldest pending event is dropped and counted.

use crate::error::Result;
use crate::metrics;
use crate::rate_limit::escalation::EscalationTransition;
use crate::rate_limit::types::{BlockedReason, CheckMetadata, Decision, EscalationLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of events buffered before the oldest is dropped
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Audit event type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Emitted once per check, allowed or denied
    RateLimitCheck,
    /// Emitted on every transition into Flagged or Blocked
    Escalation,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub policy: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    pub child_safety: bool,
    pub reason: BlockedReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_level: Option<EscalationLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_level: Option<EscalationLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<f64>,
    pub metadata: CheckMetadata,
}

impl AuditEvent {
    /// Record of a completed check
    pub fn check(policy: &str, key: &str, decision: &Decision, metadata: &CheckMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: AuditEventKind::RateLimitCheck,
            policy: policy.to_string(),
            key: key.to_string(),
            allowed: Some(decision.allowed),
            remaining: Some(decision.remaining),
            child_safety: decision.child_safety_triggered,
            reason: decision.blocked_reason,
            from_level: None,
            to_level: None,
            blocked_until: None,
            metadata: metadata.clone(),
        }
    }

    /// Record of an escalation transition
    pub fn escalation(
        policy: &str,
        key: &str,
        transition: &EscalationTransition,
        metadata: &CheckMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: AuditEventKind::Escalation,
            policy: policy.to_string(),
            key: key.to_string(),
            allowed: Some(false),
            remaining: None,
            child_safety: transition.reason == BlockedReason::ChildSafetyEscalation,
            reason: transition.reason,
            from_level: Some(transition.from),
            to_level: Some(transition.to),
            blocked_until: transition.blocked_until,
            metadata: metadata.clone(),
        }
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Writes audit events as structured log lines under the `safelimit::audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.metadata)?;
        match event.kind {
            AuditEventKind::Escalation => warn!(
                target: "safelimit::audit",
                event_id = %event.id,
                policy = %event.policy,
                key = %event.key,
                child_safety = event.child_safety,
                reason = event.reason.as_str(),
                from = ?event.from_level,
                to = ?event.to_level,
                blocked_until = ?event.blocked_until,
                metadata = %payload,
                "Rate limit escalation"
            ),
            AuditEventKind::RateLimitCheck => info!(
                target: "safelimit::audit",
                event_id = %event.id,
                policy = %event.policy,
                key = %event.key,
                allowed = ?event.allowed,
                remaining = ?event.remaining,
                child_safety = event.child_safety,
                reason = event.reason.as_str(),
                metadata = %payload,
                "Rate limit check"
            ),
        }
        Ok(())
    }
}

/// Keeps audit events in memory, mostly for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Bounded, drop-oldest audit queue
#[derive(Clone)]
pub struct AuditDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl AuditDispatcher {
    /// Create a dispatcher holding at most `capacity` pending events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity: capacity.max(1),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue an event, evicting the oldest one if the queue is full
    pub fn emit(&self, event: AuditEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(event_id = %event.id, "Audit dispatcher closed, discarding event");
            return;
        }

        let evicted = {
            let mut queue = self.queue();
            let evicted = if queue.len() >= self.inner.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            evicted
        };

        if let Some(evicted) = evicted {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_audit_dropped();
            debug!(event_id = %evicted.id, "Audit queue full, dropped oldest event");
        }

        self.inner.notify.notify_one();
    }

    /// Number of events waiting for the worker
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Take every pending event without a worker
    pub fn drain(&self) -> Vec<AuditEvent> {
        self.queue().drain(..).collect()
    }

    /// Spawn the worker that forwards events to `sink`.
    ///
    /// The worker exits after [`AuditDispatcher::close`] once the queue is empty.
    pub fn spawn_worker(&self, sink: Arc<dyn AuditSink>) -> JoinHandle<()> {
        let dispatcher = self.clone();

        tokio::spawn(async move {
            info!(capacity = dispatcher.inner.capacity, "Audit worker started");

            loop {
                let batch = dispatcher.drain();

                if batch.is_empty() {
                    if dispatcher.inner.closed.load(Ordering::Acquire) {
                        break;
                    }
                    dispatcher.inner.notify.notified().await;
                    continue;
                }

                for event in &batch {
                    if let Err(e) = sink.record(event).await {
                        warn!(event_id = %event.id, error = %e, "Failed to record audit event");
                    }
                }
            }

            info!(dropped = dispatcher.dropped(), "Audit worker stopped");
        })
    }

    /// Stop accepting events and let the worker finish the backlog
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEvent>> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AuditDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("capacity", &self.inner.capacity)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}
