use crate::error_class::ErrorClass;
use crate::events::{EventRecord, EventSink, ResilienceEvent};
use crate::resilience::lock;
use crate::resilience::store::StoreHandle;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" | "halfopen" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_rate_threshold() -> f64 {
    50.0
}
fn default_window_size() -> u32 {
    20
}
fn default_minimum_calls() -> u32 {
    10
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    1
}
fn default_half_open_max_requests() -> u32 {
    1
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failure percentage over the window that opens the circuit, in `(0, 100]`.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Outcomes kept in the sliding window (count bound).
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Optional age bound for window entries.
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// The rate rule applies only once the window holds this many outcomes.
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
    /// Hard timeout for calls made through [`CircuitBreaker::execute`].
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            window_size: default_window_size(),
            window_ms: None,
            minimum_calls: default_minimum_calls(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
            half_open_max_requests: default_half_open_max_requests(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    pub fn with_window_size(mut self, size: u32) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_minimum_calls(mut self, n: u32) -> Self {
        self.minimum_calls = n;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn with_half_open_max_requests(mut self, n: u32) -> Self {
        self.half_open_max_requests = n;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self, prefix: &str) -> Result<()> {
        use crate::config::invalid;
        if self.failure_threshold == 0 {
            return Err(invalid(
                format!("{}.failure_threshold", prefix),
                "failure threshold must be at least 1",
                "0",
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(invalid(
                format!("{}.failure_rate_threshold", prefix),
                "failure rate threshold must be in (0, 100]",
                self.failure_rate_threshold.to_string(),
            ));
        }
        if self.window_size == 0 || self.window_ms == Some(0) {
            return Err(invalid(
                format!("{}.window_size", prefix),
                "failure window must be non-empty",
                "0",
            ));
        }
        if self.success_threshold == 0 || self.half_open_max_requests == 0 {
            return Err(invalid(
                format!("{}.success_threshold", prefix),
                "half-open success threshold and probe cap must be at least 1",
                format!(
                    "success_threshold={}, half_open_max_requests={}",
                    self.success_threshold, self.half_open_max_requests
                ),
            ));
        }
        if self.reset_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(invalid(
                format!("{}.reset_timeout_ms", prefix),
                "timeouts must be positive",
                format!(
                    "reset_timeout_ms={}, request_timeout_ms={}",
                    self.reset_timeout_ms, self.request_timeout_ms
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    success: bool,
    at: Instant,
    duration: Duration,
    class: Option<ErrorClass>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejected: u64,
    fallbacks: u64,
}

#[derive(Debug)]
struct Inner {
    cfg: CircuitBreakerConfig,
    state: CircuitState,
    changed_at: Instant,
    /// Bumped on every transition; stale permits and timers compare against it.
    epoch: u64,
    history: VecDeque<CallRecord>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    totals: Totals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    epoch: u64,
}

impl Inner {
    fn prune(&mut self, now: Instant) {
        while self.history.len() > self.cfg.window_size as usize {
            self.history.pop_front();
        }
        if let Some(ms) = self.cfg.window_ms {
            let max_age = Duration::from_millis(ms);
            while let Some(r) = self.history.front() {
                if now.saturating_duration_since(r.at) >= max_age {
                    self.history.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let failures = self.history.iter().filter(|r| !r.success).count();
        failures as f64 * 100.0 / self.history.len() as f64
    }

    /// The only place state changes.
    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.changed_at = now;
        self.epoch += 1;
        self.half_open_in_flight = 0;
        match to {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.history.clear();
            }
            CircuitState::Open => {
                self.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
            }
        }
        Some(Transition {
            from,
            to,
            epoch: self.epoch,
        })
    }

    /// OPEN -> HALF_OPEN once the reset timeout has elapsed.
    fn maybe_half_open(&mut self, now: Instant) -> Option<Transition> {
        if self.state == CircuitState::Open
            && now.saturating_duration_since(self.changed_at) >= self.cfg.reset_timeout()
        {
            self.transition(CircuitState::HalfOpen, now)
        } else {
            None
        }
    }

    fn open_remaining(&self, now: Instant) -> Duration {
        self.cfg
            .reset_timeout()
            .saturating_sub(now.saturating_duration_since(self.changed_at))
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub window_calls: usize,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub rejected: u64,
    pub fallbacks: u64,
    pub avg_duration_ms: Option<u64>,
    /// Time until an open circuit admits a probe.
    pub retry_after_ms: Option<u64>,
    pub since_change_ms: u64,
}

struct Shared {
    name: String,
    inner: Mutex<Inner>,
    sink: Arc<dyn EventSink>,
    store: Option<StoreHandle>,
}

/// Per-target circuit breaker.
///
/// - CLOSED counts failures (consecutive and rate over a bounded window)
/// - OPEN rejects until the reset timeout, then probes lazily or by timer
/// - HALF_OPEN admits a capped number of probes
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self::with_observers(name, cfg, crate::events::noop_sink(), None)
    }

    pub fn with_observers(
        name: impl Into<String>,
        cfg: CircuitBreakerConfig,
        sink: Arc<dyn EventSink>,
        store: Option<StoreHandle>,
    ) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                inner: Mutex::new(Inner {
                    cfg,
                    state: CircuitState::Closed,
                    changed_at: now,
                    epoch: 0,
                    history: VecDeque::new(),
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    half_open_in_flight: 0,
                    totals: Totals::default(),
                }),
                sink,
                store,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        lock(&self.shared.inner).cfg.clone()
    }

    /// Adopt new thresholds without touching state or history.
    pub fn update_config(&self, cfg: &CircuitBreakerConfig) {
        let mut inner = lock(&self.shared.inner);
        if inner.cfg != *cfg {
            inner.cfg = cfg.clone();
            inner.prune(Instant::now());
        }
    }

    /// Current state, performing the lazy OPEN -> HALF_OPEN transition if due.
    pub fn state(&self) -> CircuitState {
        let (state, t) = {
            let mut inner = lock(&self.shared.inner);
            let t = inner.maybe_half_open(Instant::now());
            (inner.state, t)
        };
        if let Some(t) = t {
            self.announce(t);
        }
        state
    }

    /// Ask for admission. A rejection is `Error::CircuitOpen`.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let now = Instant::now();
        let (outcome, t) = {
            let mut inner = lock(&self.shared.inner);
            let t = inner.maybe_half_open(now);
            let outcome = match inner.state {
                CircuitState::Closed => Ok((false, inner.epoch)),
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < inner.cfg.half_open_max_requests {
                        inner.half_open_in_flight += 1;
                        Ok((true, inner.epoch))
                    } else {
                        inner.totals.rejected += 1;
                        Err((CircuitState::HalfOpen, None))
                    }
                }
                CircuitState::Open => {
                    inner.totals.rejected += 1;
                    Err((CircuitState::Open, Some(inner.open_remaining(now))))
                }
            };
            (outcome, t)
        };
        if let Some(t) = t {
            self.announce(t);
        }
        match outcome {
            Ok((probe, epoch)) => Ok(CallPermit {
                breaker: self,
                probe,
                epoch,
                started: now,
                done: false,
            }),
            Err((state, retry_after)) => {
                tracing::debug!(target_name = %self.shared.name, state = %state, "call rejected");
                self.shared
                    .sink
                    .emit(EventRecord::new(ResilienceEvent::CallRejected {
                        target: self.shared.name.clone(),
                        state,
                        retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
                    }));
                Err(Error::CircuitOpen {
                    target: self.shared.name.clone(),
                    retry_after,
                })
            }
        }
    }

    /// Whether a call would currently be admitted, without taking a probe slot.
    pub fn is_call_permitted(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let inner = lock(&self.shared.inner);
                inner.half_open_in_flight < inner.cfg.half_open_max_requests
            }
        }
    }

    /// Apply a call outcome. `permit` is `(probe, epoch)` for calls admitted
    /// through [`CallPermit`]; an outcome from an earlier epoch only feeds the
    /// totals and history, never the counters that drive transitions.
    fn record(
        &self,
        success: bool,
        class: Option<ErrorClass>,
        permit: Option<(bool, u64)>,
        duration: Duration,
    ) {
        let now = Instant::now();
        let t = {
            let mut inner = lock(&self.shared.inner);
            let current = permit.map_or(true, |(_, epoch)| epoch == inner.epoch);
            if matches!(permit, Some((true, _))) && current {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            if !success && !class.map_or(true, |c| c.counts_against_target()) {
                return;
            }
            inner.history.push_back(CallRecord {
                success,
                at: now,
                duration,
                class,
            });
            inner.prune(now);
            if success {
                inner.totals.successes += 1;
            } else {
                inner.totals.failures += 1;
                if class == Some(ErrorClass::Timeout) {
                    inner.totals.timeouts += 1;
                }
            }
            if !current {
                tracing::debug!(target_name = %self.shared.name, success, "outcome from an earlier state ignored");
                None
            } else if success {
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                inner.consecutive_failures = 0;
                if inner.state == CircuitState::HalfOpen
                    && inner.consecutive_successes >= inner.cfg.success_threshold
                {
                    inner.transition(CircuitState::Closed, now)
                } else {
                    None
                }
            } else {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.consecutive_successes = 0;
                match inner.state {
                    CircuitState::HalfOpen => inner.transition(CircuitState::Open, now),
                    CircuitState::Closed => {
                        let by_count = inner.consecutive_failures >= inner.cfg.failure_threshold;
                        let by_rate = inner.history.len() >= inner.cfg.minimum_calls.max(1) as usize
                            && inner.failure_rate() >= inner.cfg.failure_rate_threshold;
                        if by_count || by_rate {
                            inner.transition(CircuitState::Open, now)
                        } else {
                            None
                        }
                    }
                    CircuitState::Open => None,
                }
            }
        };
        if let Some(t) = t {
            self.announce(t);
        }
    }

    /// Record a success observed outside a permit.
    pub fn record_success(&self, duration: Duration) {
        self.record(true, None, None, duration);
    }

    /// Record a failure observed outside a permit.
    pub fn record_failure(&self, class: ErrorClass, duration: Duration) {
        self.record(false, Some(class), None, duration);
    }

    /// Administrative reset: CLOSED with empty history and zeroed counters.
    pub fn reset(&self) {
        let t = {
            let mut inner = lock(&self.shared.inner);
            let t = inner.transition(CircuitState::Closed, Instant::now());
            inner.history.clear();
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.half_open_in_flight = 0;
            inner.totals = Totals::default();
            t
        };
        tracing::info!(target_name = %self.shared.name, "circuit reset");
        if let Some(t) = t {
            self.announce(t);
        }
    }

    /// Operational override. Forcing OPEN arms the reset timer as usual.
    pub fn force_state(&self, state: CircuitState) {
        let t = lock(&self.shared.inner).transition(state, Instant::now());
        tracing::info!(target_name = %self.shared.name, state = %state, "circuit state forced");
        if let Some(t) = t {
            self.announce(t);
        }
    }

    pub(crate) fn note_fallback(&self) {
        lock(&self.shared.inner).totals.fallbacks += 1;
        self.shared
            .sink
            .emit(EventRecord::new(ResilienceEvent::BreakerFallback {
                target: self.shared.name.clone(),
            }));
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = lock(&self.shared.inner);
        inner.prune(now);
        let avg_duration_ms = if inner.history.is_empty() {
            None
        } else {
            let total: Duration = inner.history.iter().map(|r| r.duration).sum();
            Some((total.as_millis() / inner.history.len() as u128) as u64)
        };
        CircuitSnapshot {
            target: self.shared.name.clone(),
            state: inner.state,
            failure_rate: inner.failure_rate(),
            window_calls: inner.history.len(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.half_open_in_flight,
            total_successes: inner.totals.successes,
            total_failures: inner.totals.failures,
            total_timeouts: inner.totals.timeouts,
            rejected: inner.totals.rejected,
            fallbacks: inner.totals.fallbacks,
            avg_duration_ms,
            retry_after_ms: (inner.state == CircuitState::Open)
                .then(|| inner.open_remaining(now).as_millis() as u64),
            since_change_ms: now.saturating_duration_since(inner.changed_at).as_millis() as u64,
        }
    }

    /// Run `f` if admitted, under the configured request timeout.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        self.run(permit, f).await
    }

    /// Like [`execute`](Self::execute), but a rejection runs `fallback` instead
    /// of returning `CircuitOpen`.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(&self, f: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(Error) -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.try_acquire() {
            Ok(permit) => self.run(permit, f).await,
            Err(rejection) => {
                self.note_fallback();
                fallback(rejection).await
            }
        }
    }

    async fn run<T, F, Fut>(&self, permit: CallPermit<'_>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = lock(&self.shared.inner).cfg.request_timeout();
        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(v)) => {
                permit.success();
                Ok(v)
            }
            Ok(Err(e)) => {
                permit.failure(e.class().unwrap_or(ErrorClass::Unknown));
                Err(e)
            }
            Err(_) => {
                // the call may still complete provider-side
                permit.failure(ErrorClass::Timeout);
                Err(Error::timeout(self.shared.name.clone(), timeout))
            }
        }
    }

    fn announce(&self, t: Transition) {
        let name = &self.shared.name;
        match t.to {
            CircuitState::Open => tracing::warn!(target_name = %name, from = %t.from, "circuit opened"),
            _ => tracing::info!(target_name = %name, from = %t.from, to = %t.to, "circuit transition"),
        }
        self.shared
            .sink
            .emit(EventRecord::new(ResilienceEvent::CircuitTransition {
                target: name.clone(),
                from: t.from,
                to: t.to,
            }));
        if let Some(store) = &self.shared.store {
            let target = name.clone();
            let state = t.to;
            store.spawn(move |s| async move { s.publish_circuit(&target, state).await });
        }
        if t.to == CircuitState::Open {
            self.arm_reset_timer(t.epoch);
        }
    }

    /// Timer half of the OPEN -> HALF_OPEN transition; a no-op if the lazy
    /// path or any other transition got there first.
    fn arm_reset_timer(&self, epoch: u64) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let delay = lock(&self.shared.inner).cfg.reset_timeout();
        rt.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let breaker = CircuitBreaker { shared };
            let t = {
                let mut inner = lock(&breaker.shared.inner);
                if inner.epoch != epoch {
                    return;
                }
                inner.maybe_half_open(Instant::now())
            };
            if let Some(t) = t {
                breaker.announce(t);
            }
        });
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping it unreported releases a half-open
/// probe slot without recording anything.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    epoch: u64,
    started: Instant,
    done: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.done = true;
        let elapsed = self.started.elapsed();
        self.breaker
            .record(true, None, Some((self.probe, self.epoch)), elapsed);
    }

    pub fn failure(mut self, class: ErrorClass) {
        self.done = true;
        let elapsed = self.started.elapsed();
        self.breaker
            .record(false, Some(class), Some((self.probe, self.epoch)), elapsed);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.done || !self.probe {
            return;
        }
        let mut inner = lock(&self.breaker.shared.inner);
        if inner.epoch == self.epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryEventSink;

    fn breaker(cfg: CircuitBreakerConfig) -> (CircuitBreaker, Arc<InMemoryEventSink>) {
        let sink = Arc::new(InMemoryEventSink::new(100));
        (
            CircuitBreaker::with_observers("openai:gpt", cfg, sink.clone(), None),
            sink,
        )
    }

    fn fail(b: &CircuitBreaker) {
        b.try_acquire().unwrap().failure(ErrorClass::ServerError);
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout(), Duration::from_secs(30));
        assert!(config.validate("cb").is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_secs(10))
            .with_success_threshold(2);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout_ms, 10_000);
        assert_eq!(config.success_threshold, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_consecutive_threshold() {
        let (cb, sink) = breaker(CircuitBreakerConfig::new().with_failure_threshold(3));
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().err().unwrap();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert!(err.retry_after().unwrap() > Duration::ZERO);
        assert_eq!(cb.snapshot().rejected, 1);
        assert_eq!(sink.get_events_by_name("circuit_transition").len(), 1);
        assert_eq!(sink.get_events_by_name("call_rejected").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let (cb, _) = breaker(CircuitBreakerConfig::new().with_failure_threshold(3));
        fail(&cb);
        fail(&cb);
        cb.try_acquire().unwrap().success();
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_failure_rate_after_minimum_calls() {
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(100)
            .with_failure_rate_threshold(50.0)
            .with_minimum_calls(4)
            .with_window_size(10);
        let (cb, _) = breaker(cfg);
        cb.try_acquire().unwrap().success();
        fail(&cb);
        cb.try_acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);
        // 2 of 4 failed
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_cap_and_close() {
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_secs(5))
            .with_success_threshold(2)
            .with_half_open_max_requests(1);
        let (cb, _) = breaker(cfg);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(5)).await;

        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());
        probe.success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.try_acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().window_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_secs(1));
        let (cb, _) = breaker(cfg);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(cb.try_acquire().unwrap());
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_moves_to_half_open() {
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_secs(2));
        let (cb, sink) = breaker(cfg);
        fail(&cb);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let transitions = sink.get_events_by_name("circuit_transition");
        assert_eq!(transitions.len(), 2);
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
        // lazy check after the timer is a no-op
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(sink.get_events_by_name("circuit_transition").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_does_not_count() {
        let (cb, _) = breaker(CircuitBreakerConfig::new().with_failure_threshold(1));
        cb.try_acquire().unwrap().failure(ErrorClass::Cancelled);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_timeout_counts_as_failure() {
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_request_timeout(Duration::from_millis(100));
        let (cb, _) = breaker(cfg);
        let res: Result<()> = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), Error>(())
            })
            .await;
        assert!(matches!(res, Err(Error::Timeout { .. })));
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.total_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_fallback_on_open() {
        let (cb, sink) = breaker(CircuitBreakerConfig::new().with_failure_threshold(1));
        fail(&cb);
        let called = std::sync::atomic::AtomicBool::new(false);
        let res = cb
            .execute_with_fallback(
                || async {
                    called.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, Error>("primary")
                },
                |_err| async { Ok::<_, Error>("fallback") },
            )
            .await
            .unwrap();
        assert_eq!(res, "fallback");
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(cb.snapshot().fallbacks, 1);
        assert_eq!(sink.get_events_by_name("breaker_fallback").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_state_and_reset() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        fail(&cb);
        cb.force_state(CircuitState::Open);
        assert!(!cb.is_call_permitted());
        cb.reset();
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_failures, 0);
        assert_eq!(snap.window_calls, 0);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(CircuitState::parse("half-open"), Some(CircuitState::HalfOpen));
        assert_eq!(CircuitState::parse("OPEN"), Some(CircuitState::Open));
        assert_eq!(CircuitState::parse("ajar"), None);
    }
}
