//! 回退编排执行：按链顺序尝试目标，结合熔断、准入、重试与取消。
//!
//! Chain walk for one logical request.
//!
//! For each target in order: ask its breaker for a permit (skip when open),
//! pass the admission gate (skip when denied), then run up to
//! `max_retries + 1` attempts under the per-call timeout. Three clocks bound
//! the walk: per-call timeout, queued admission timeout and the overall
//! request deadline. Cancellation is observed during calls, admission waits
//! and backoff sleeps alike.

use crate::config::SharedConfig;
use crate::context::RequestContext;
use crate::error_class::ErrorClass;
use crate::events::{EventRecord, EventSink, ResilienceEvent};
use crate::orchestrator::chain::{FallbackChain, Target, TargetId};
use crate::orchestrator::policy::Decision;
use crate::resilience::breaker_registry::BreakerRegistry;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token usage reported by a generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// What a generation function returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl GenerationResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Handed to the generation function for every attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub target: Target,
    /// 0-based attempt number on this target.
    pub attempt: u32,
    pub request_id: String,
    /// Same for every attempt of the request; pass it to providers that
    /// deduplicate, since a timed-out call may still complete upstream.
    pub idempotency_key: String,
    /// Cancelled when the request is cancelled or its deadline passes.
    pub cancel: CancellationToken,
}

/// Why a target was passed over without a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    AdmissionDenied,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::AdmissionDenied => "admission_denied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { class: ErrorClass },
    Skipped { reason: SkipReason },
}

impl AttemptOutcome {
    /// Short tag for logs and error summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "ok",
            AttemptOutcome::Failed { class } => class.name(),
            AttemptOutcome::Skipped { reason } => reason.as_str(),
        }
    }
}

/// One entry of a request's attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub target: TargetId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }

    pub fn skipped(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Skipped { .. })
    }

    pub fn class(&self) -> Option<ErrorClass> {
        match self.outcome {
            AttemptOutcome::Failed { class } => Some(class),
            _ => None,
        }
    }
}

/// A target as it appears in the provenance of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriedTarget {
    pub target: TargetId,
    pub skipped: bool,
    pub attempts: u32,
}

/// Successful result plus provenance.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub response: GenerationResponse,
    pub target_used: TargetId,
    pub attempts: Vec<AttemptRecord>,
    /// Retries across all targets (not counting each target's first attempt).
    pub retries: u32,
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    pub fn content(&self) -> &str {
        &self.response.content
    }

    /// Targets in the order they were tried or skipped.
    pub fn attempted_targets(&self) -> Vec<TriedTarget> {
        let mut out: Vec<TriedTarget> = Vec::new();
        for a in &self.attempts {
            match out.last_mut() {
                Some(last) if last.target == a.target => {
                    if !a.skipped() {
                        last.attempts += 1;
                        last.skipped = false;
                    }
                }
                _ => out.push(TriedTarget {
                    target: a.target.clone(),
                    skipped: a.skipped(),
                    attempts: u32::from(!a.skipped()),
                }),
            }
        }
        out
    }
}

/// Admission control consulted before every attempt.
///
/// Implementations may wait (queued admission) and must honour
/// `ctx.cancel`. Return `Error::AdmissionDenied` to skip the target or
/// `Error::Cancelled` to stop.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admit(&self, ctx: &RequestContext, target: &Target) -> Result<()>;
}

enum Bounded<T> {
    Done(T),
    Cancelled,
    Deadline,
}

/// Run `fut` until it completes, `cancel` fires or `deadline` passes.
async fn bounded<T>(
    fut: impl Future<Output = T>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Bounded<T> {
    let expiry = async {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        _ = expiry => Bounded::Deadline,
        v = fut => Bounded::Done(v),
    }
}

/// Stateless coordinator over the breaker registry, an optional admission
/// gate and the configured retry policy.
pub struct Orchestrator {
    config: SharedConfig,
    breakers: Arc<BreakerRegistry>,
    gate: Option<Arc<dyn AdmissionGate>>,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(config: SharedConfig, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            config,
            breakers,
            gate: None,
            sink: crate::events::noop_sink(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    fn emit(&self, ctx: &RequestContext, event: ResilienceEvent) {
        self.sink
            .emit(EventRecord::new(event).with_request_id(ctx.request_id.clone()));
    }

    /// Walk `chain` until a target succeeds.
    ///
    /// Errors: `NonRetryable` for failures every target would repeat,
    /// `Exhausted` when no target succeeded, `Cancelled`, and
    /// `DeadlineExceeded` when the overall request timeout passes.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &RequestContext,
        chain: &FallbackChain,
        call: F,
    ) -> Result<ExecutionOutcome>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<GenerationResponse>>,
    {
        if chain.is_empty() {
            return Err(Error::configuration_with_context(
                "fallback chain is empty",
                ErrorContext::new()
                    .with_source("orchestrator")
                    .with_request_id(ctx.request_id.clone()),
            ));
        }

        let cfg = self.config.load();
        let policy = &cfg.retry;
        let started = Instant::now();
        let timeout = match (cfg.request_timeout(), ctx.timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let deadline = timeout.map(|t| started + t);
        // child token so a passed deadline also signals the in-flight call
        let call_cancel = ctx.cancel.child_token();
        let _cancel_guard = call_cancel.clone().drop_guard();

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut retries: u32 = 0;
        let mut hint: Option<Duration> = None;

        let cancelled = |attempts: Vec<AttemptRecord>| -> Result<ExecutionOutcome> {
            tracing::debug!(request_id = %ctx.request_id, "request cancelled");
            Err(Error::Cancelled { attempts })
        };
        let expired = |attempts: Vec<AttemptRecord>| -> Result<ExecutionOutcome> {
            tracing::warn!(request_id = %ctx.request_id, "request deadline exceeded");
            Err(Error::DeadlineExceeded {
                after: timeout.unwrap_or_default(),
                attempts,
            })
        };

        for (idx, target) in chain.iter().enumerate() {
            let id = target.id();
            let breaker = self.breakers.get_or_create(id.as_str());
            let budget = target.max_retries.unwrap_or(policy.max_retries);
            let mut attempt: u32 = 0;

            loop {
                if ctx.cancel.is_cancelled() {
                    return cancelled(attempts);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return expired(attempts);
                }

                let permit = match breaker.try_acquire() {
                    Ok(p) => p,
                    Err(e) => {
                        hint = min_hint(hint, e.retry_after());
                        breaker.note_fallback();
                        self.skip(ctx, &mut attempts, &id, attempt, SkipReason::CircuitOpen);
                        break;
                    }
                };

                let permit = if let Some(gate) = &self.gate {
                    // no probe slot is held while the request waits for admission
                    drop(permit);
                    match bounded(gate.admit(ctx, target), deadline, &ctx.cancel).await {
                        Bounded::Done(Ok(())) => {}
                        Bounded::Done(Err(Error::Cancelled { .. })) | Bounded::Cancelled => {
                            return cancelled(attempts);
                        }
                        Bounded::Deadline => return expired(attempts),
                        Bounded::Done(Err(e)) => {
                            hint = min_hint(hint, e.retry_after());
                            self.skip(ctx, &mut attempts, &id, attempt, SkipReason::AdmissionDenied);
                            break;
                        }
                    }
                    match breaker.try_acquire() {
                        Ok(p) => p,
                        Err(e) => {
                            hint = min_hint(hint, e.retry_after());
                            breaker.note_fallback();
                            self.skip(ctx, &mut attempts, &id, attempt, SkipReason::CircuitOpen);
                            break;
                        }
                    }
                } else {
                    permit
                };

                let per_call = target
                    .timeout()
                    .map_or(breaker.config().request_timeout(), |t| {
                        t.min(breaker.config().request_timeout())
                    });
                let actx = AttemptContext {
                    target: target.clone(),
                    attempt,
                    request_id: ctx.request_id.clone(),
                    idempotency_key: ctx.idempotency_key.clone(),
                    cancel: call_cancel.clone(),
                };
                let t0 = Instant::now();
                let result = bounded(
                    tokio::time::timeout(per_call, call(actx)),
                    deadline,
                    &ctx.cancel,
                )
                .await;
                let duration = t0.elapsed();

                let err = match result {
                    Bounded::Done(Ok(Ok(response))) => {
                        permit.success();
                        attempts.push(AttemptRecord {
                            target: id.clone(),
                            attempt,
                            outcome: AttemptOutcome::Succeeded,
                            duration,
                            usage: response.usage,
                        });
                        tracing::debug!(
                            request_id = %ctx.request_id,
                            target_name = %id,
                            attempt,
                            duration_ms = duration.as_millis() as u64,
                            "attempt succeeded"
                        );
                        return Ok(ExecutionOutcome {
                            response,
                            target_used: id,
                            attempts,
                            retries,
                            elapsed: started.elapsed(),
                        });
                    }
                    Bounded::Done(Ok(Err(e))) => e,
                    // ambiguous: the provider may still complete the call
                    Bounded::Done(Err(_)) => Error::timeout(id.to_string(), per_call),
                    Bounded::Cancelled => {
                        // unreported permit: the probe slot is released, nothing recorded
                        drop(permit);
                        attempts.push(failed(&id, attempt, ErrorClass::Cancelled, duration));
                        return cancelled(attempts);
                    }
                    Bounded::Deadline => {
                        drop(permit);
                        attempts.push(failed(&id, attempt, ErrorClass::Timeout, duration));
                        return expired(attempts);
                    }
                };

                let class = err.class().unwrap_or(ErrorClass::Unknown);
                permit.failure(class);
                attempts.push(failed(&id, attempt, class, duration));

                let decision = policy.decide(class, attempt, budget, err.retry_after());
                let will_retry = matches!(decision, Decision::Retry { .. });
                tracing::debug!(
                    request_id = %ctx.request_id,
                    target_name = %id,
                    attempt,
                    class = class.name(),
                    will_retry,
                    error = %err,
                    "attempt failed"
                );
                self.emit(
                    ctx,
                    ResilienceEvent::AttemptFailed {
                        target: id.to_string(),
                        attempt,
                        class,
                        will_retry,
                    },
                );

                match decision {
                    Decision::Retry { delay } => {
                        retries += 1;
                        attempt += 1;
                        if !delay.is_zero() {
                            match bounded(tokio::time::sleep(delay), deadline, &ctx.cancel).await {
                                Bounded::Done(()) => {}
                                Bounded::Cancelled => return cancelled(attempts),
                                Bounded::Deadline => return expired(attempts),
                            }
                        }
                    }
                    Decision::Fallback => {
                        hint = min_hint(hint, err.retry_after());
                        break;
                    }
                    Decision::Abort => {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            target_name = %id,
                            class = class.name(),
                            "non-retryable failure, aborting chain"
                        );
                        return Err(Error::NonRetryable {
                            target: id.to_string(),
                            class,
                            message: err.to_string(),
                            attempts,
                        });
                    }
                    Decision::Cancelled => return cancelled(attempts),
                }
            }

            if let Some(next) = chain.targets().get(idx + 1) {
                tracing::info!(
                    request_id = %ctx.request_id,
                    from = %id,
                    to = %next,
                    "falling back to next target"
                );
                self.emit(
                    ctx,
                    ResilienceEvent::ChainFallback {
                        from: id.to_string(),
                        to: next.name(),
                    },
                );
            }
        }

        let targets: Vec<String> = chain.iter().map(Target::name).collect();
        tracing::warn!(
            request_id = %ctx.request_id,
            targets = ?targets,
            attempts = attempts.len(),
            retries,
            "fallback chain exhausted"
        );
        self.emit(
            ctx,
            ResilienceEvent::ChainExhausted {
                targets,
                attempts: attempts.len(),
            },
        );
        Err(Error::Exhausted {
            attempts,
            retry_after: hint,
        })
    }

    fn skip(
        &self,
        ctx: &RequestContext,
        attempts: &mut Vec<AttemptRecord>,
        id: &TargetId,
        attempt: u32,
        reason: SkipReason,
    ) {
        tracing::debug!(request_id = %ctx.request_id, target_name = %id, reason = reason.as_str(), "target skipped");
        attempts.push(AttemptRecord {
            target: id.clone(),
            attempt,
            outcome: AttemptOutcome::Skipped { reason },
            duration: Duration::ZERO,
            usage: None,
        });
        self.emit(
            ctx,
            ResilienceEvent::TargetSkipped {
                target: id.to_string(),
                reason: reason.as_str().to_string(),
            },
        );
    }
}

fn failed(id: &TargetId, attempt: u32, class: ErrorClass, duration: Duration) -> AttemptRecord {
    AttemptRecord {
        target: id.clone(),
        attempt,
        outcome: AttemptOutcome::Failed { class },
        duration,
        usage: None,
    }
}

fn min_hint(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::orchestrator::policy::RetryPolicy;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::telemetry::InMemoryEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn orchestrator(retry: RetryPolicy) -> (Orchestrator, Arc<InMemoryEventSink>) {
        let mut cfg = ResilienceConfig::default();
        cfg.retry = retry;
        let shared = SharedConfig::new(cfg);
        let sink = Arc::new(InMemoryEventSink::new(1000));
        let breakers = Arc::new(BreakerRegistry::with_observers(shared.clone(), sink.clone(), None));
        (Orchestrator::new(shared, breakers).with_sink(sink.clone()), sink)
    }

    fn chain(names: &[&str]) -> FallbackChain {
        FallbackChain::from_names(names.iter().copied())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_target_success() {
        let (orch, _) = orchestrator(RetryPolicy::default());
        let out = orch
            .execute(&RequestContext::new(), &chain(&["a:m", "b:m"]), |a| async move {
                Ok(GenerationResponse::new(format!("from {}", a.target)))
            })
            .await
            .unwrap();
        assert_eq!(out.target_used, "a:m");
        assert_eq!(out.content(), "from a:m");
        assert_eq!(out.retries, 0);
        assert_eq!(out.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_counts_retries() {
        let (orch, sink) = orchestrator(RetryPolicy::default().with_max_retries(2));
        let calls = AtomicU32::new(0);
        let out = orch
            .execute(&RequestContext::new(), &chain(&["a:m"]), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::from_status(503, "unavailable"))
                    } else {
                        Ok(GenerationResponse::new("ok"))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out.retries, 2);
        assert_eq!(out.attempts.len(), 3);
        assert_eq!(sink.get_events_by_name("attempt_failed").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_aborts_chain() {
        let (orch, _) = orchestrator(RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let err = orch
            .execute(&RequestContext::new(), &chain(&["a:m", "b:m"]), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<GenerationResponse, _>(Error::from_status(400, "bad schema")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonRetryable { class: ErrorClass::InvalidRequest, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.targets_tried(), vec!["a:m".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_falls_back_without_retry() {
        let (orch, sink) = orchestrator(RetryPolicy::default().with_max_retries(3));
        let out = orch
            .execute(&RequestContext::new(), &chain(&["a:gone", "b:m"]), |a| async move {
                if a.target.model == "gone" {
                    Err(Error::from_status(404, "model_not_found"))
                } else {
                    Ok(GenerationResponse::new("ok"))
                }
            })
            .await
            .unwrap();
        assert_eq!(out.target_used, "b:m");
        assert_eq!(out.retries, 0);
        assert_eq!(sink.get_events_by_name("chain_fallback").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_is_a_failure() {
        let (orch, _) = orchestrator(RetryPolicy::none());
        let target = Target::new("slow", "m").with_timeout(Duration::from_millis(100));
        let err = orch
            .execute(&RequestContext::new(), &FallbackChain::new(vec![target]), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(GenerationResponse::new("late"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert_eq!(err.attempts()[0].class(), Some(ErrorClass::Timeout));
        let snap = &orch.breakers().snapshot()[0];
        assert_eq!(snap.total_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_stops_the_walk() {
        let (orch, _) = orchestrator(
            RetryPolicy::default()
                .with_max_retries(10)
                .with_delays(Duration::from_secs(1), Duration::from_secs(1))
                .with_jitter(0.0),
        );
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(2500));
        let err = orch
            .execute(&ctx, &chain(&["a:m"]), |_| async {
                Err::<GenerationResponse, _>(Error::transient("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert_eq!(err.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (orch, _) = orchestrator(
            RetryPolicy::default()
                .with_delays(Duration::from_secs(10), Duration::from_secs(10))
                .with_jitter(0.0),
        );
        let token = CancellationToken::new();
        let ctx = RequestContext::new().with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let calls = AtomicU32::new(0);
        let err = orch
            .execute(&ctx, &chain(&["a:m", "b:m"]), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<GenerationResponse, _>(Error::transient("boom")) }
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_target_is_skipped_and_counted() {
        let (orch, sink) = orchestrator(RetryPolicy::none());
        orch.breakers().force_state("a:m", CircuitState::Open);
        let out = orch
            .execute(&RequestContext::new(), &chain(&["a:m", "b:m"]), |_| async {
                Ok(GenerationResponse::new("ok"))
            })
            .await
            .unwrap();
        let tried = out.attempted_targets();
        assert_eq!(tried.len(), 2);
        assert!(tried[0].skipped);
        assert_eq!(tried[1].attempts, 1);
        assert_eq!(sink.get_events_by_name("target_skipped").len(), 1);
        let a = orch.breakers().get("a:m").unwrap().snapshot();
        assert_eq!(a.rejected, 1);
        assert_eq!(a.fallbacks, 1);
    }

    struct WatchingGate {
        breakers: Arc<BreakerRegistry>,
        slot_free: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl AdmissionGate for WatchingGate {
        async fn admit(&self, _ctx: &RequestContext, target: &Target) -> Result<()> {
            let breaker = self.breakers.get_or_create(target.id().as_str());
            self.slot_free.lock().unwrap().push(breaker.is_call_permitted());
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_slot_not_held_during_admission() {
        let mut cfg = ResilienceConfig::default();
        cfg.circuit_breaker.defaults.half_open_max_requests = 1;
        cfg.circuit_breaker.defaults.success_threshold = 1;
        let shared = SharedConfig::new(cfg);
        let breakers = Arc::new(BreakerRegistry::new(shared.clone()));
        let gate = Arc::new(WatchingGate {
            breakers: breakers.clone(),
            slot_free: std::sync::Mutex::new(Vec::new()),
        });
        let orch = Orchestrator::new(shared, breakers.clone()).with_gate(gate.clone());
        breakers.get_or_create("a:m").force_state(CircuitState::HalfOpen);

        let out = orch
            .execute(&RequestContext::new(), &chain(&["a:m"]), |_| async {
                Ok(GenerationResponse::new("ok"))
            })
            .await
            .unwrap();
        assert_eq!(out.target_used, "a:m");
        assert_eq!(*gate.slot_free.lock().unwrap(), vec![true]);
        assert_eq!(breakers.get_or_create("a:m").state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotency_key_is_stable_across_attempts() {
        let (orch, _) = orchestrator(RetryPolicy::default().with_max_retries(1).with_jitter(0.0));
        let ctx = RequestContext::new().with_idempotency_key("idem-1");
        let seen = std::sync::Mutex::new(Vec::new());
        let _ = orch
            .execute(&ctx, &chain(&["a:m", "b:m"]), |a| {
                seen.lock().unwrap().push(a.idempotency_key.clone());
                async { Err::<GenerationResponse, _>(Error::transient("boom")) }
            })
            .await;
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|k| k == "idem-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_chain_is_configuration_error() {
        let (orch, _) = orchestrator(RetryPolicy::default());
        let err = orch
            .execute(&RequestContext::new(), &FallbackChain::default(), |_| async {
                Ok(GenerationResponse::new("never"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
