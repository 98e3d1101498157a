//! Token bucket and request window: the per-key admission primitives.
//!
//! Both structures take the current instant as an argument so the owner can
//! refill, prune, check and debit under one lock with one clock reading.
//! Instants come from `tokio::time` so paused-clock tests drive them.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

// absorbs float drift from fractional refills
const EPSILON: f64 = 1e-9;

/// Capacity-limited counter replenished at a fixed rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    tokens_per_interval: f64,
    interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, tokens_per_interval: f64, interval: Duration, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            tokens_per_interval,
            interval,
            last_refill: now,
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let interval = self.interval.as_secs_f64();
        if interval > 0.0 && self.tokens_per_interval > 0.0 {
            let added = elapsed.as_secs_f64() / interval * self.tokens_per_interval;
            self.tokens = (self.tokens + added).min(self.capacity);
        }
        self.last_refill = now;
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn can_consume(&self, cost: f64) -> bool {
        self.tokens + EPSILON >= cost
    }

    pub fn consume(&mut self, cost: f64) {
        self.tokens = (self.tokens - cost).clamp(0.0, self.capacity);
    }

    /// Return previously consumed tokens (never above capacity).
    pub fn refund(&mut self, cost: f64) {
        self.tokens = (self.tokens + cost).min(self.capacity);
    }

    /// Time until `cost` tokens are available; `None` if they never will be.
    pub fn time_until(&self, cost: f64) -> Option<Duration> {
        if cost > self.capacity + EPSILON {
            return None;
        }
        if self.can_consume(cost) {
            return Some(Duration::ZERO);
        }
        if self.tokens_per_interval <= 0.0 {
            return None;
        }
        let missing = cost - self.tokens;
        let secs = missing / self.tokens_per_interval * self.interval.as_secs_f64();
        // too far out to represent counts as never
        Duration::try_from_secs_f64(secs.max(0.0)).ok()
    }

    /// Adopt new parameters, keeping accrued tokens but clamping to the new capacity.
    pub fn reconfigure(
        &mut self,
        capacity: u32,
        tokens_per_interval: f64,
        interval: Duration,
        now: Instant,
    ) {
        self.refill(now);
        self.capacity = capacity as f64;
        self.tokens_per_interval = tokens_per_interval;
        self.interval = interval;
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn reset(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }
}

/// How a [`RequestWindow`] counts requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Exact log of request instants within the last `window`.
    #[default]
    Sliding,
    /// One counter per aligned window; cheaper, allows edge bursts.
    Fixed,
}

/// Request counter over a recent time span, independent of the bucket.
#[derive(Debug, Clone)]
pub struct RequestWindow {
    mode: WindowMode,
    size: Duration,
    max_requests: u32,
    entries: VecDeque<Instant>,
    fixed_start: Instant,
    fixed_count: u32,
}

impl RequestWindow {
    pub fn new(mode: WindowMode, size: Duration, max_requests: u32, now: Instant) -> Self {
        Self {
            mode,
            size,
            max_requests,
            entries: VecDeque::new(),
            fixed_start: now,
            fixed_count: 0,
        }
    }

    /// Drop everything older than the window. Call before any read.
    pub fn prune(&mut self, now: Instant) {
        match self.mode {
            WindowMode::Sliding => {
                while let Some(&oldest) = self.entries.front() {
                    if now.saturating_duration_since(oldest) >= self.size {
                        self.entries.pop_front();
                    } else {
                        break;
                    }
                }
            }
            WindowMode::Fixed => {
                let elapsed = now.saturating_duration_since(self.fixed_start);
                if elapsed >= self.size && !self.size.is_zero() {
                    let windows = (elapsed.as_nanos() / self.size.as_nanos()) as u32;
                    self.fixed_start += self.size * windows;
                    self.fixed_count = 0;
                }
            }
        }
    }

    pub fn count(&self) -> u32 {
        match self.mode {
            WindowMode::Sliding => self.entries.len() as u32,
            WindowMode::Fixed => self.fixed_count,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.count())
    }

    pub fn has_room(&self) -> bool {
        self.count() < self.max_requests
    }

    pub fn record(&mut self, now: Instant) {
        match self.mode {
            WindowMode::Sliding => self.entries.push_back(now),
            WindowMode::Fixed => self.fixed_count = self.fixed_count.saturating_add(1),
        }
    }

    /// Undo the most recent `record`.
    pub fn unrecord(&mut self) {
        match self.mode {
            WindowMode::Sliding => {
                self.entries.pop_back();
            }
            WindowMode::Fixed => self.fixed_count = self.fixed_count.saturating_sub(1),
        }
    }

    /// Time until the window has room for one more request. Saturates at
    /// `Duration::MAX` when the slot lies beyond the clock's range.
    pub fn time_until_slot(&self, now: Instant) -> Duration {
        if self.has_room() {
            return Duration::ZERO;
        }
        match self.mode {
            WindowMode::Sliding => {
                // the entry whose expiry frees the first slot
                let idx = (self.count() - self.max_requests) as usize;
                self.entries
                    .get(idx)
                    .map(|t| match t.checked_add(self.size) {
                        Some(free) => free.saturating_duration_since(now),
                        None => Duration::MAX,
                    })
                    .unwrap_or(Duration::ZERO)
            }
            WindowMode::Fixed => match self.fixed_start.checked_add(self.size) {
                Some(next) => next.saturating_duration_since(now),
                None => Duration::MAX,
            },
        }
    }

    pub fn reconfigure(&mut self, mode: WindowMode, size: Duration, max_requests: u32, now: Instant) {
        if mode != self.mode {
            // carry the count over conservatively
            let count = self.count();
            self.entries.clear();
            self.fixed_count = 0;
            self.fixed_start = now;
            self.mode = mode;
            for _ in 0..count {
                self.record(now);
            }
        }
        self.size = size;
        self.max_requests = max_requests;
        self.prune(now);
    }

    pub fn reset(&mut self, now: Instant) {
        self.entries.clear();
        self.fixed_count = 0;
        self.fixed_start = now;
    }
}
