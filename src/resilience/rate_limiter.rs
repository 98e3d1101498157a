use crate::config::SharedConfig;
use crate::context::Priority;
use crate::events::{EventRecord, EventSink, ResilienceEvent};
use crate::resilience::bucket::{RequestWindow, TokenBucket, WindowMode};
use crate::resilience::lock;
use crate::resilience::queue::{AdmissionQueue, QueuedRequest};
use crate::resilience::store::StoreHandle;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// stands in for "never" when a queue timeout overflows the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn default_max_burst() -> u32 {
    60
}
fn default_tokens_per_interval() -> f64 {
    60.0
}
fn default_interval_ms() -> u64 {
    60_000
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_max_requests_per_window() -> u32 {
    60
}
fn default_max_queue_size() -> usize {
    100
}
fn default_queue_timeout_ms() -> u64 {
    30_000
}

/// Bucket, window and queue parameters for one scope or key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Bucket capacity.
    #[serde(default = "default_max_burst")]
    pub max_burst: u32,
    #[serde(default = "default_tokens_per_interval")]
    pub tokens_per_interval: f64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: u32,
    #[serde(default)]
    pub window_mode: WindowMode,
    /// Zero disables queueing for this scope.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_burst: default_max_burst(),
            tokens_per_interval: default_tokens_per_interval(),
            interval_ms: default_interval_ms(),
            window_ms: default_window_ms(),
            max_requests_per_window: default_max_requests_per_window(),
            window_mode: WindowMode::default(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl LimitConfig {
    /// `rps` requests per second, burst of one second's worth (at least 1).
    pub fn per_second(rps: f64) -> Self {
        let n = rps.ceil().max(1.0) as u32;
        Self {
            max_burst: n,
            tokens_per_interval: rps,
            interval_ms: 1_000,
            window_ms: 1_000,
            max_requests_per_window: n,
            ..Self::default()
        }
    }

    /// `rpm` requests per minute.
    pub fn per_minute(rpm: f64) -> Self {
        let n = rpm.ceil().max(1.0) as u32;
        Self {
            max_burst: n,
            tokens_per_interval: rpm,
            interval_ms: 60_000,
            window_ms: 60_000,
            max_requests_per_window: n,
            ..Self::default()
        }
    }

    pub fn with_burst(mut self, max_burst: u32) -> Self {
        self.max_burst = max_burst;
        self
    }

    pub fn with_refill(mut self, tokens: f64, interval: Duration) -> Self {
        self.tokens_per_interval = tokens;
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_window(mut self, max_requests: u32, window: Duration) -> Self {
        self.max_requests_per_window = max_requests;
        self.window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_window_mode(mut self, mode: WindowMode) -> Self {
        self.window_mode = mode;
        self
    }

    pub fn with_queue(mut self, max_size: usize, timeout: Duration) -> Self {
        self.max_queue_size = max_size;
        self.queue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn validate(&self, prefix: &str) -> Result<()> {
        use crate::config::invalid;
        if self.max_burst == 0 || self.max_requests_per_window == 0 {
            return Err(invalid(
                format!("{}.max_burst", prefix),
                "capacity must be positive",
                format!(
                    "max_burst={}, max_requests_per_window={}",
                    self.max_burst, self.max_requests_per_window
                ),
            ));
        }
        if !self.tokens_per_interval.is_finite() || self.tokens_per_interval <= 0.0 {
            return Err(invalid(
                format!("{}.tokens_per_interval", prefix),
                "refill rate must be a positive number",
                self.tokens_per_interval.to_string(),
            ));
        }
        if self.interval_ms == 0 || self.window_ms == 0 {
            return Err(invalid(
                format!("{}.interval_ms", prefix),
                "interval and window must be positive",
                format!("interval_ms={}, window_ms={}", self.interval_ms, self.window_ms),
            ));
        }
        if self.max_queue_size > 0 && self.queue_timeout_ms == 0 {
            return Err(invalid(
                format!("{}.queue_timeout_ms", prefix),
                "queued requests need a positive timeout",
                "0",
            ));
        }
        Ok(())
    }
}

/// Result of an admission check against one or more keys.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmitDecision {
    /// The most restrictive key.
    pub key: String,
    pub allowed: bool,
    pub remaining_tokens: f64,
    pub remaining_window_slots: u32,
    /// When the key can next admit a request of the same cost.
    pub reset_at: Instant,
    /// Set on denial; `None` on a denial means the cost can never fit.
    pub retry_after: Option<Duration>,
}

impl AdmitDecision {
    fn unlimited(now: Instant) -> Self {
        Self {
            key: String::new(),
            allowed: true,
            remaining_tokens: f64::INFINITY,
            remaining_window_slots: u32::MAX,
            reset_at: now,
            retry_after: None,
        }
    }

    /// Requests of cost 1 that could still be admitted right now.
    pub fn headroom(&self) -> f64 {
        self.remaining_tokens
            .floor()
            .min(self.remaining_window_slots as f64)
    }

    pub fn is_unlimited(&self) -> bool {
        self.key.is_empty()
    }
}

/// Point-in-time view of one limiter key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub key: String,
    pub tokens: f64,
    pub max_burst: u32,
    pub window_count: u32,
    pub max_requests_per_window: u32,
    pub queue_len: usize,
    /// Wait before a cost-1 request would be admitted.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct KeyState {
    limit: LimitConfig,
    bucket: TokenBucket,
    window: RequestWindow,
    last_seen: Instant,
}

impl KeyState {
    fn new(limit: &LimitConfig, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(
                limit.max_burst,
                limit.tokens_per_interval,
                limit.interval(),
                now,
            ),
            window: RequestWindow::new(
                limit.window_mode,
                limit.window(),
                limit.max_requests_per_window,
                now,
            ),
            limit: limit.clone(),
            last_seen: now,
        }
    }

    /// Adopt a changed limit, then refill and prune. Runs before every read.
    fn refresh(&mut self, limit: &LimitConfig, now: Instant) {
        if self.limit != *limit {
            self.bucket.reconfigure(
                limit.max_burst,
                limit.tokens_per_interval,
                limit.interval(),
                now,
            );
            self.window.reconfigure(
                limit.window_mode,
                limit.window(),
                limit.max_requests_per_window,
                now,
            );
            self.limit = limit.clone();
        }
        self.bucket.refill(now);
        self.window.prune(now);
        self.last_seen = now;
    }

    fn fits(&self, cost: u32) -> bool {
        cost as f64 <= self.bucket.capacity()
    }

    fn can_admit(&self, cost: u32) -> bool {
        self.fits(cost) && self.bucket.can_consume(cost as f64) && self.window.has_room()
    }

    /// `None` when the cost never fits or the wait runs past the clock's range.
    fn wait_for(&self, cost: u32, now: Instant) -> Option<Duration> {
        let bucket = self.bucket.time_until(cost as f64)?;
        let wait = bucket.max(self.window.time_until_slot(now));
        now.checked_add(wait).map(|_| wait)
    }

    fn decision(&self, key: &str, cost: u32, allowed: bool, now: Instant) -> AdmitDecision {
        let wait = self.wait_for(cost, now);
        AdmitDecision {
            key: key.to_string(),
            allowed,
            remaining_tokens: self.bucket.tokens(),
            remaining_window_slots: self.window.remaining(),
            reset_at: now + wait.unwrap_or(Duration::ZERO),
            retry_after: if allowed { None } else { wait },
        }
    }
}

/// Multi-key token-bucket + window limiter with priority queues.
///
/// Each key's state sits behind its own mutex; a multi-key admission locks
/// its keys in sorted order so concurrent checks cannot deadlock, and debits
/// every key or none.
pub struct RateLimiter {
    config: SharedConfig,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
    queues: RwLock<HashMap<String, Arc<Mutex<AdmissionQueue>>>>,
    store: Option<StoreHandle>,
    sink: Arc<dyn EventSink>,
    seq: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: SharedConfig) -> Self {
        Self::with_observers(config, crate::events::noop_sink(), None)
    }

    pub fn with_observers(
        config: SharedConfig,
        sink: Arc<dyn EventSink>,
        store: Option<StoreHandle>,
    ) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            store,
            sink,
            seq: AtomicU64::new(0),
        }
    }

    fn state(&self, key: &str, limit: &LimitConfig, now: Instant) -> Arc<Mutex<KeyState>> {
        if let Some(st) = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Arc::clone(st);
        }
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            keys.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(KeyState::new(limit, now)))),
        )
    }

    /// Limited keys among `keys`, sorted and deduplicated, with their limits.
    fn limited(&self, keys: &[String]) -> Option<Vec<(String, LimitConfig)>> {
        let cfg = self.config.load();
        if !cfg.limiter.enabled {
            return None;
        }
        let mut out: Vec<(String, LimitConfig)> = keys
            .iter()
            .filter_map(|k| cfg.limiter.limit_for(k).map(|l| (k.clone(), l.clone())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.dedup_by(|a, b| a.0 == b.0);
        Some(out)
    }

    /// Check (and, if `debit`, consume) `cost` against every key atomically.
    fn evaluate(&self, keys: &[String], cost: u32, debit: bool) -> AdmitDecision {
        let now = Instant::now();
        let limited = match self.limited(keys) {
            Some(l) if !l.is_empty() => l,
            _ => return AdmitDecision::unlimited(now),
        };
        let states: Vec<Arc<Mutex<KeyState>>> = limited
            .iter()
            .map(|(k, l)| self.state(k, l, now))
            .collect();
        let mut guards: Vec<MutexGuard<'_, KeyState>> = states.iter().map(|s| lock(s)).collect();

        for (g, (_, limit)) in guards.iter_mut().zip(&limited) {
            g.refresh(limit, now);
        }
        let admissible: Vec<bool> = guards.iter().map(|g| g.can_admit(cost)).collect();
        let allowed = admissible.iter().all(|ok| *ok);
        if allowed && debit && cost > 0 {
            for g in guards.iter_mut() {
                g.bucket.consume(cost as f64);
                g.window.record(now);
            }
        }
        // on denial only the blocking keys are candidates
        let decisions: Vec<AdmitDecision> = guards
            .iter()
            .zip(&limited)
            .zip(&admissible)
            .filter(|(_, ok)| allowed || !**ok)
            .map(|((g, (k, _)), _)| g.decision(k, cost, allowed, now))
            .collect();
        drop(guards);
        most_restrictive(decisions, allowed)
    }

    /// Non-queueing admission for a single key.
    pub async fn admit(&self, key: &str, cost: u32) -> AdmitDecision {
        self.admit_all(&[key.to_string()], cost).await
    }

    /// Non-queueing admission against every key at once. Requests already
    /// queued on any of the keys are served first. Consults the shared store
    /// when one is configured; store trouble degrades to local-only limiting.
    pub async fn admit_all(&self, keys: &[String], cost: u32) -> AdmitDecision {
        if let Some(queued) = self.backlog(keys) {
            return queued;
        }
        if cost > 0 {
            if let Some(denied) = self.check_fleet(keys).await {
                return denied;
            }
        }
        let decision = self.evaluate(keys, cost, true);
        if decision.allowed && cost > 0 {
            self.mirror(keys);
        }
        decision
    }

    /// Synchronous, local-only admission.
    pub fn try_admit(&self, keys: &[String], cost: u32) -> AdmitDecision {
        if let Some(queued) = self.backlog(keys) {
            return queued;
        }
        self.evaluate(keys, cost, true)
    }

    /// Admission check that never debits.
    pub fn peek(&self, keys: &[String], cost: u32) -> AdmitDecision {
        self.evaluate(keys, cost, false)
    }

    async fn check_fleet(&self, keys: &[String]) -> Option<AdmitDecision> {
        let store = self.store.as_ref()?;
        let limited = self.limited(keys)?;
        for (key, limit) in limited {
            let Some(count) = store.window_count(&key, limit.window()).await else {
                // degraded; local limits still apply
                return None;
            };
            if count >= limit.max_requests_per_window as u64 {
                let spacing = limit.window() / limit.max_requests_per_window.max(1);
                tracing::debug!(key = %key, count, "fleet window full");
                let now = Instant::now();
                let reset_at = now.checked_add(spacing);
                return Some(AdmitDecision {
                    key,
                    allowed: false,
                    remaining_tokens: 0.0,
                    remaining_window_slots: 0,
                    reset_at: reset_at.unwrap_or(now),
                    retry_after: reset_at.map(|_| spacing),
                });
            }
        }
        None
    }

    fn mirror(&self, keys: &[String]) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(limited) = self.limited(keys) else {
            return;
        };
        store.spawn(move |s| async move {
            for (key, limit) in limited {
                s.incr_window(&key, limit.window()).await;
            }
        });
    }

    /// Give back a debit made for a request that will not run.
    fn refund(&self, keys: &[String], cost: u32) {
        if cost == 0 {
            return;
        }
        let Some(limited) = self.limited(keys) else {
            return;
        };
        let now = Instant::now();
        let states: Vec<_> = limited.iter().map(|(k, l)| self.state(k, l, now)).collect();
        let mut guards: Vec<_> = states.iter().map(|s| lock(s)).collect();
        for g in guards.iter_mut() {
            g.bucket.refund(cost as f64);
            g.window.unrecord();
        }
    }

    fn queue(&self, scope: &str) -> Arc<Mutex<AdmissionQueue>> {
        if let Some(q) = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
        {
            return Arc::clone(q);
        }
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            queues
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(AdmissionQueue::new()))),
        )
    }

    fn emit(&self, event: ResilienceEvent, request_id: Option<&str>) {
        let mut rec = EventRecord::new(event);
        if let Some(id) = request_id {
            rec = rec.with_request_id(id);
        }
        self.sink.emit(rec);
    }

    /// Admission with optional queueing.
    ///
    /// Without `wait`, a denial returns `Error::AdmissionDenied` immediately.
    /// With `wait`, the request joins the priority queue of the most
    /// restrictive key and resolves exactly once: admitted by the drainer,
    /// denied when its queue timeout passes, or cancelled.
    pub async fn acquire(
        &self,
        keys: &[String],
        cost: u32,
        priority: Priority,
        wait: bool,
        cancel: &CancellationToken,
        request_id: Option<&str>,
    ) -> Result<AdmitDecision> {
        let decision = self.admit_all(keys, cost).await;
        if decision.allowed {
            return Ok(decision);
        }
        self.emit(
            ResilienceEvent::AdmissionDenied {
                key: decision.key.clone(),
                retry_after_ms: decision.retry_after.map(|d| d.as_millis() as u64),
            },
            request_id,
        );
        let denied = |d: &AdmitDecision| Error::AdmissionDenied {
            key: d.key.clone(),
            retry_after: d.retry_after,
        };
        if !wait || decision.retry_after.is_none() {
            return Err(denied(&decision));
        }
        let limit = match self.config.load().limiter.limit_for(&decision.key) {
            Some(l) if l.max_queue_size > 0 => l.clone(),
            _ => return Err(denied(&decision)),
        };

        let scope = decision.key.clone();
        let queue = self.queue(&scope);
        let (tx, mut rx) = oneshot::channel();
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let enqueued_at = Instant::now();
        let deadline = enqueued_at
            .checked_add(limit.queue_timeout())
            .unwrap_or_else(|| enqueued_at + FAR_FUTURE);
        let pushed = lock(&queue).push(
            QueuedRequest {
                id,
                priority,
                keys: keys.to_vec(),
                cost,
                enqueued_at,
                deadline,
                tx,
            },
            limit.max_queue_size,
        );
        let queue_len = match pushed {
            Ok(len) => len,
            Err(_) => {
                tracing::warn!(scope = %scope, "admission queue full");
                return Err(denied(&decision));
            }
        };
        self.emit(ResilienceEvent::RequestQueued { scope: scope.clone(), queue_len }, request_id);

        enum Wake {
            Admitted(AdmitDecision),
            Expired,
            Cancelled,
        }
        let wake = tokio::select! {
            res = &mut rx => match res {
                Ok(d) => Wake::Admitted(d),
                Err(_) => Wake::Expired,
            },
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Wake::Expired,
        };
        let wake = match wake {
            Wake::Admitted(d) => Wake::Admitted(d),
            other => {
                let removed = lock(&queue).remove(id);
                // the drainer resolves under the queue lock, so a missing
                // entry means its answer is already in the channel
                match (removed, rx.try_recv()) {
                    (false, Ok(d)) => match other {
                        Wake::Cancelled => {
                            self.refund(keys, cost);
                            Wake::Cancelled
                        }
                        _ => Wake::Admitted(d),
                    },
                    _ => other,
                }
            }
        };

        match wake {
            Wake::Admitted(d) => {
                tracing::debug!(scope = %scope, waited_ms = enqueued_at.elapsed().as_millis() as u64, "queued request admitted");
                if cost > 0 {
                    self.mirror(keys);
                }
                Ok(d)
            }
            Wake::Cancelled => Err(Error::Cancelled { attempts: Vec::new() }),
            Wake::Expired => {
                self.emit(
                    ResilienceEvent::QueueTimeout {
                        scope: scope.clone(),
                        waited_ms: enqueued_at.elapsed().as_millis() as u64,
                    },
                    request_id,
                );
                let fresh = self.peek(keys, cost);
                Err(Error::AdmissionDenied {
                    key: scope,
                    retry_after: fresh.retry_after.or(decision.retry_after),
                })
            }
        }
    }

    /// Admit queued requests in priority order while capacity allows.
    /// Returns how many were admitted.
    pub fn drain_queues(&self) -> usize {
        let queues: Vec<(String, Arc<Mutex<AdmissionQueue>>)> = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, q)| (k.clone(), Arc::clone(q)))
            .collect();
        queues
            .iter()
            .map(|(scope, queue)| self.drain_queue(scope, queue))
            .sum()
    }

    fn drain_queue(&self, scope: &str, queue: &Mutex<AdmissionQueue>) -> usize {
        let now = Instant::now();
        let mut admitted = 0;
        let mut q = lock(queue);
        q.purge(now);
        while let Some(head) = q.peek() {
            // head-of-line: lower priorities wait behind a blocked head
            let d = self.evaluate(&head.keys, head.cost, true);
            if !d.allowed {
                break;
            }
            let Some(entry) = q.pop() else {
                break;
            };
            tracing::debug!(
                scope = %scope,
                priority = ?entry.priority,
                waited_ms = now.saturating_duration_since(entry.enqueued_at).as_millis() as u64,
                "admitting queued request"
            );
            if entry.tx.send(d).is_err() {
                self.refund(&entry.keys, entry.cost);
                continue;
            }
            admitted += 1;
        }
        admitted
    }

    /// Serve the queues of `keys` first; if any still holds waiters, a
    /// newcomer is denied on that scope so it cannot overtake them.
    fn backlog(&self, keys: &[String]) -> Option<AdmitDecision> {
        let limited = self.limited(keys)?;
        let queues: Vec<(String, Arc<Mutex<AdmissionQueue>>)> = {
            let map = self.queues.read().unwrap_or_else(|e| e.into_inner());
            limited
                .iter()
                .filter_map(|(k, _)| map.get(k).map(|q| (k.clone(), Arc::clone(q))))
                .collect()
        };
        for (scope, queue) in &queues {
            self.drain_queue(scope, queue);
        }
        for (scope, queue) in queues {
            let head = lock(&queue).peek().map(|h| (h.keys.clone(), h.cost));
            let Some((head_keys, head_cost)) = head else {
                continue;
            };
            let blocked = self.peek(&head_keys, head_cost);
            let wait = blocked.retry_after.unwrap_or(Duration::ZERO);
            tracing::debug!(scope = %scope, "requests already queued; newcomer waits");
            return Some(AdmitDecision {
                key: scope,
                allowed: false,
                remaining_tokens: blocked.remaining_tokens,
                remaining_window_slots: blocked.remaining_window_slots,
                reset_at: blocked.reset_at,
                retry_after: Some(wait),
            });
        }
        None
    }

    pub fn queue_len(&self, scope: &str) -> usize {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
            .map(|q| lock(q).len())
            .unwrap_or(0)
    }

    pub fn snapshot_key(&self, key: &str) -> Option<KeySnapshot> {
        let cfg = self.config.load();
        let limit = cfg.limiter.limit_for(key)?.clone();
        let state = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();
        let now = Instant::now();
        let (tokens, window_count, wait) = match state {
            Some(st) => {
                let mut g = lock(&st);
                g.refresh(&limit, now);
                (
                    g.bucket.tokens(),
                    g.window.count(),
                    g.wait_for(1, now).unwrap_or(Duration::ZERO),
                )
            }
            None => (limit.max_burst as f64, 0, Duration::ZERO),
        };
        Some(KeySnapshot {
            key: key.to_string(),
            tokens,
            max_burst: limit.max_burst,
            window_count,
            max_requests_per_window: limit.max_requests_per_window,
            queue_len: self.queue_len(key),
            retry_after_ms: wait.as_millis() as u64,
        })
    }

    /// Snapshots of every key currently held in memory, sorted by key.
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let mut keys: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys.iter().filter_map(|k| self.snapshot_key(k)).collect()
    }

    /// Administrative reset: refill the bucket and clear the window.
    pub fn reset_key(&self, key: &str) -> bool {
        let state = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();
        let Some(state) = state else {
            return false;
        };
        {
            let now = Instant::now();
            let mut g = lock(&state);
            g.bucket.reset(now);
            g.window.reset(now);
        }
        tracing::info!(key = %key, "limiter key reset");
        if let Some(store) = &self.store {
            let key = key.to_string();
            store.spawn(move |s| async move { s.clear_window(&key).await });
        }
        self.drain_queues();
        true
    }

    /// Forget keys idle for longer than `idle` and not in use. A forgotten
    /// key comes back at full capacity.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        if idle.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let before = keys.len();
        keys.retain(|_, st| {
            Arc::strong_count(st) > 1
                || now.saturating_duration_since(lock(st).last_seen) < idle
        });
        let evicted = before - keys.len();
        drop(keys);
        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, q| Arc::strong_count(q) > 1 || !lock(q).is_empty());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle limiter keys");
        }
        evicted
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A denial with the longest wait (never-satisfiable first), else the
/// allowed decision with the least headroom.
fn most_restrictive(decisions: Vec<AdmitDecision>, allowed: bool) -> AdmitDecision {
    let now = Instant::now();
    if allowed {
        return decisions
            .into_iter()
            .min_by(|a, b| a.headroom().total_cmp(&b.headroom()))
            .unwrap_or_else(|| AdmitDecision::unlimited(now));
    }
    decisions
        .into_iter()
        .filter(|d| !d.allowed)
        .max_by(|a, b| match (a.retry_after, b.retry_after) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .unwrap_or_else(|| AdmitDecision::unlimited(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;

    fn limiter_with(scopes: &[(&str, LimitConfig)]) -> RateLimiter {
        let mut cfg = ResilienceConfig::default();
        for (name, limit) in scopes {
            cfg.limiter.scopes.insert(name.to_string(), limit.clone());
        }
        RateLimiter::new(SharedConfig::new(cfg))
    }

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_limit_config_per_second() {
        let l = LimitConfig::per_second(0.5);
        assert_eq!(l.max_burst, 1);
        assert_eq!(l.tokens_per_interval, 0.5);
        assert!(l.validate("x").is_ok());
        assert!(LimitConfig::default().with_burst(0).validate("x").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_keys_are_unlimited() {
        let rl = limiter_with(&[]);
        let d = rl.try_admit(&keys(&["global", "user:1"]), 1);
        assert!(d.allowed);
        assert!(d.is_unlimited());
        assert_eq!(rl.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_key_debits_all_or_none() {
        let rl = limiter_with(&[
            ("global", LimitConfig::default().with_burst(10)),
            ("user", LimitConfig::default().with_burst(1)),
        ]);
        let ks = keys(&["global", "user:1"]);
        assert!(rl.try_admit(&ks, 1).allowed);
        let denied = rl.try_admit(&ks, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.key, "user:1");
        // the denial did not debit the global key
        assert_eq!(rl.snapshot_key("global").unwrap().tokens.round(), 9.0);
        assert_eq!(rl.snapshot_key("global").unwrap().window_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_result_reports_lowest_headroom() {
        let rl = limiter_with(&[
            ("global", LimitConfig::default().with_burst(10)),
            ("provider", LimitConfig::default().with_burst(3)),
        ]);
        let d = rl.try_admit(&keys(&["global", "provider:openai"]), 1);
        assert!(d.allowed);
        assert_eq!(d.key, "provider:openai");
        assert_eq!(d.headroom(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cost_is_idempotent() {
        let rl = limiter_with(&[("global", LimitConfig::default().with_burst(2))]);
        let ks = keys(&["global"]);
        rl.try_admit(&ks, 1);
        let before = rl.snapshot_key("global").unwrap();
        for _ in 0..5 {
            rl.try_admit(&ks, 0);
        }
        let after = rl.snapshot_key("global").unwrap();
        assert_eq!(before.tokens, after.tokens);
        assert_eq!(before.window_count, after.window_count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_above_capacity_never_fits() {
        let rl = limiter_with(&[("global", LimitConfig::default().with_burst(5))]);
        let d = rl.try_admit(&keys(&["global"]), 6);
        assert!(!d.allowed);
        assert_eq!(d.retry_after, None);
        let err = rl
            .acquire(&keys(&["global"]), 6, Priority::High, true, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { retry_after: None, .. }));
        assert_eq!(rl.queue_len("global"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_resolves_denied() {
        let limit = LimitConfig::default()
            .with_burst(1)
            .with_queue(10, Duration::from_secs(1));
        let rl = limiter_with(&[("global", limit)]);
        let ks = keys(&["global"]);
        assert!(rl.try_admit(&ks, 1).allowed);
        let err = rl
            .acquire(&ks, 1, Priority::Normal, true, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
        assert!(err.retry_after().unwrap() > Duration::ZERO);
        assert_eq!(rl.queue_len("global"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects_immediately() {
        let limit = LimitConfig::default()
            .with_burst(1)
            .with_queue(1, Duration::from_secs(60));
        let rl = Arc::new(limiter_with(&[("global", limit)]));
        let ks = keys(&["global"]);
        assert!(rl.try_admit(&ks, 1).allowed);

        let waiter = {
            let rl = rl.clone();
            let ks = ks.clone();
            tokio::spawn(async move {
                rl.acquire(&ks, 1, Priority::Normal, true, &CancellationToken::new(), None)
                    .await
            })
        };
        while rl.queue_len("global") == 0 {
            tokio::task::yield_now().await;
        }
        let start = Instant::now();
        let err = rl
            .acquire(&ks, 1, Priority::Critical, true, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);
        waiter.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued() {
        let limit = LimitConfig::default().with_burst(1);
        let rl = limiter_with(&[("global", limit)]);
        let ks = keys(&["global"]);
        rl.try_admit(&ks, 1);
        let token = CancellationToken::new();
        token.cancel();
        let err = rl
            .acquire(&ks, 1, Priority::Normal, true, &token, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(rl.queue_len("global"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_clamps_existing_bucket() {
        let shared = SharedConfig::new({
            let mut c = ResilienceConfig::default();
            c.limiter
                .scopes
                .insert("global".into(), LimitConfig::default().with_burst(10));
            c
        });
        let rl = RateLimiter::new(shared.clone());
        rl.try_admit(&keys(&["global"]), 1);
        let mut next = (*shared.load()).clone();
        next.limiter
            .scopes
            .insert("global".into(), LimitConfig::default().with_burst(3));
        shared.store(next).unwrap();
        let snap = rl.snapshot_key("global").unwrap();
        assert_eq!(snap.max_burst, 3);
        assert!(snap.tokens <= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_evict() {
        let rl = limiter_with(&[("user", LimitConfig::default().with_burst(1))]);
        let ks = keys(&["user:a"]);
        rl.try_admit(&ks, 1);
        assert!(!rl.try_admit(&ks, 1).allowed);
        assert!(rl.reset_key("user:a"));
        assert!(rl.try_admit(&ks, 1).allowed);
        assert!(!rl.reset_key("user:b"));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(rl.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(rl.key_count(), 0);
    }
}
