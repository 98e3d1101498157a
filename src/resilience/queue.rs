//! Per-scope priority queue for admissions that must wait for capacity.
//!
//! Entries are ordered by `(priority desc, arrival asc)`. Each entry leaves the
//! queue exactly once: popped and resolved through its completion handle by
//! the drainer, or removed by its waiter on timeout or cancellation.

use crate::context::Priority;
use crate::resilience::rate_limiter::AdmitDecision;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) struct QueuedRequest {
    pub id: u64,
    pub priority: Priority,
    pub keys: Vec<String>,
    pub cost: u32,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub tx: oneshot::Sender<AdmitDecision>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // max-heap: higher priority first, then lower id (earlier arrival) first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub(crate) struct AdmissionQueue {
    heap: BinaryHeap<QueuedRequest>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Rejects (returns the entry) when the queue already holds `max` entries.
    pub fn push(&mut self, req: QueuedRequest, max: usize) -> Result<usize, QueuedRequest> {
        if self.heap.len() >= max {
            return Err(req);
        }
        self.heap.push(req);
        Ok(self.heap.len())
    }

    pub fn peek(&self) -> Option<&QueuedRequest> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }

    /// Remove entry `id`; false if it already left the queue.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.heap.len();
        self.heap.retain(|r| r.id != id);
        self.heap.len() != before
    }

    /// Drop entries whose waiter is gone or whose deadline passed. Dropping
    /// the sender wakes any remaining waiter as not admitted.
    pub fn purge(&mut self, now: Instant) -> usize {
        let before = self.heap.len();
        self.heap
            .retain(|r| !r.tx.is_closed() && r.deadline > now);
        before - self.heap.len()
    }
}
