//! 可观测性事件：熔断转换、拒绝、排队与回退事件，以及 EventSink 观察者接口。
//!
//! Observability events (always compiled).
//!
//! Every state transition, rejection and fallback in the resilience core is
//! reported as an [`EventRecord`] to an injected [`EventSink`]. The core never
//! emits while holding a per-key or per-target lock, and sinks must not block.
//! Concrete sinks live in [`crate::telemetry`].

use crate::error_class::ErrorClass;
use crate::resilience::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A single observable occurrence inside the resilience core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    CircuitTransition {
        target: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// The breaker refused a call without invoking it.
    CallRejected {
        target: String,
        state: CircuitState,
        retry_after_ms: Option<u64>,
    },
    /// A breaker-level fallback function ran instead of the call.
    BreakerFallback { target: String },
    AdmissionDenied {
        key: String,
        retry_after_ms: Option<u64>,
    },
    RequestQueued {
        scope: String,
        queue_len: usize,
    },
    QueueTimeout {
        scope: String,
        waited_ms: u64,
    },
    AttemptFailed {
        target: String,
        attempt: u32,
        class: ErrorClass,
        will_retry: bool,
    },
    /// The orchestrator skipped a target (open circuit or admission denial).
    TargetSkipped { target: String, reason: String },
    /// The orchestrator advanced from one target to the next.
    ChainFallback { from: String, to: String },
    ChainExhausted { targets: Vec<String>, attempts: usize },
    StoreDegraded { store: String, message: String },
}

impl ResilienceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitTransition { .. } => "circuit_transition",
            Self::CallRejected { .. } => "call_rejected",
            Self::BreakerFallback { .. } => "breaker_fallback",
            Self::AdmissionDenied { .. } => "admission_denied",
            Self::RequestQueued { .. } => "request_queued",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::AttemptFailed { .. } => "attempt_failed",
            Self::TargetSkipped { .. } => "target_skipped",
            Self::ChainFallback { .. } => "chain_fallback",
            Self::ChainExhausted { .. } => "chain_exhausted",
            Self::StoreDegraded { .. } => "store_degraded",
        }
    }

    /// Target name (`provider:model`) the event concerns, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::CircuitTransition { target, .. }
            | Self::CallRejected { target, .. }
            | Self::BreakerFallback { target }
            | Self::AttemptFailed { target, .. }
            | Self::TargetSkipped { target, .. } => Some(target),
            Self::ChainFallback { from, .. } => Some(from),
            _ => None,
        }
    }
}

/// An event plus the request it belongs to and a wall-clock timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: ResilienceEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: f64,
}

impl EventRecord {
    pub fn new(event: ResilienceEvent) -> Self {
        Self {
            event,
            request_id: None,
            timestamp: timestamp(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

impl From<ResilienceEvent> for EventRecord {
    fn from(event: ResilienceEvent) -> Self {
        Self::new(event)
    }
}

/// Observer for resilience events.
///
/// Implementations are called synchronously from request paths and must
/// return quickly: buffer, forward to a channel, or log.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Default sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _record: EventRecord) {}
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}
