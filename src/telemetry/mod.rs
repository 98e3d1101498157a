//! 遥测模块：事件接收器实现（内存、通道、tracing、组合）。
//!
//! Telemetry Module.
//!
//! Sink implementations for [`crate::events::EventSink`]. The core itself is
//! free of any monitoring backend; applications pick one of these or plug in
//! their own.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`NoopEventSink`] | Default no-op sink |
//! | [`InMemoryEventSink`] | Bounded in-memory sink for tests and debugging |
//! | [`ChannelEventSink`] | Forwards records into a tokio mpsc channel drained by a metrics collaborator |
//! | [`TracingEventSink`] | Renders records as `tracing` events |
//! | [`CompositeEventSink`] | Fan-out to multiple destinations |

pub use crate::events::{noop_sink, EventRecord, EventSink, NoopEventSink, ResilienceEvent};

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: Arc<RwLock<VecDeque<EventRecord>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::new())),
            max_events: max.max(1),
        }
    }

    pub fn get_events(&self) -> Vec<EventRecord> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Events whose kind matches `name` (see [`ResilienceEvent::name`]).
    pub fn get_events_by_name(&self, name: &str) -> Vec<EventRecord> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.event.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, record: EventRecord) {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        events.push_back(record);
        while events.len() > self.max_events {
            events.pop_front();
        }
    }
}

/// Channel sink: a metrics collaborator owns the receiver and drains it.
///
/// Uses a bounded channel; when the collaborator falls behind, records are
/// dropped and counted rather than blocking the request path.
pub struct ChannelEventSink {
    tx: mpsc::Sender<EventRecord>,
    dropped: std::sync::atomic::AtomicU64,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: std::sync::atomic::AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, record: EventRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Logs every record through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, record: EventRecord) {
        let request_id = record.request_id.as_deref().unwrap_or("-");
        match &record.event {
            ResilienceEvent::CircuitTransition { target, from, to } => {
                tracing::info!(target_name = %target, from = %from, to = %to, request_id, "circuit transition");
            }
            ResilienceEvent::CallRejected {
                target,
                state,
                retry_after_ms,
            } => {
                tracing::warn!(target_name = %target, state = %state, retry_after_ms = ?retry_after_ms, request_id, "call rejected by circuit breaker");
            }
            ResilienceEvent::BreakerFallback { target } => {
                tracing::info!(target_name = %target, request_id, "breaker fallback invoked");
            }
            ResilienceEvent::AdmissionDenied {
                key,
                retry_after_ms,
            } => {
                tracing::warn!(key = %key, retry_after_ms = ?retry_after_ms, request_id, "admission denied");
            }
            ResilienceEvent::RequestQueued { scope, queue_len } => {
                tracing::debug!(scope = %scope, queue_len, request_id, "request queued");
            }
            ResilienceEvent::QueueTimeout { scope, waited_ms } => {
                tracing::warn!(scope = %scope, waited_ms, request_id, "queued request timed out");
            }
            ResilienceEvent::AttemptFailed {
                target,
                attempt,
                class,
                will_retry,
            } => {
                tracing::debug!(target_name = %target, attempt, class = %class, will_retry, request_id, "attempt failed");
            }
            ResilienceEvent::TargetSkipped { target, reason } => {
                tracing::debug!(target_name = %target, reason = %reason, request_id, "target skipped");
            }
            ResilienceEvent::ChainFallback { from, to } => {
                tracing::info!(from = %from, to = %to, request_id, "falling back to next target");
            }
            ResilienceEvent::ChainExhausted { targets, attempts } => {
                tracing::warn!(targets = ?targets, attempts, request_id, "fallback chain exhausted");
            }
            ResilienceEvent::StoreDegraded { store, message } => {
                tracing::warn!(store = %store, error = %message, "shared store degraded; using local limits");
            }
        }
    }
}

/// Composite sink for multiple destinations.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, record: EventRecord) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for s in rest {
                s.emit(record.clone());
            }
            last.emit(record);
        }
    }
}
