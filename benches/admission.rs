//! Benchmarks for the admission hot path
//!
//! This benchmark measures:
//! - single-key and multi-key limiter admission
//! - circuit breaker permit acquisition
//! - a full orchestrated call that succeeds on the first target

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use ai_lib_resilience::config::{ResilienceConfig, SharedConfig};
use ai_lib_resilience::resilience::bucket::WindowMode;
use ai_lib_resilience::orchestrator::{FallbackChain, GenerationResponse};
use ai_lib_resilience::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use ai_lib_resilience::resilience::rate_limiter::{LimitConfig, RateLimiter};
use ai_lib_resilience::{RequestContext, ResilienceEngine};

fn generous() -> LimitConfig {
    LimitConfig::default()
        .with_burst(u32::MAX / 2)
        .with_window(u32::MAX / 2, std::time::Duration::from_secs(1))
        .with_window_mode(WindowMode::Fixed)
        .with_refill(1e9, std::time::Duration::from_secs(1))
}

fn limiter() -> RateLimiter {
    let mut cfg = ResilienceConfig::default();
    for scope in ["global", "user", "agent", "provider"] {
        cfg.limiter.scopes.insert(scope.to_string(), generous());
    }
    RateLimiter::new(SharedConfig::new(cfg))
}

fn bench_limiter(c: &mut Criterion) {
    let rl = limiter();
    let mut group = c.benchmark_group("limiter_admission");
    group.throughput(Throughput::Elements(1));

    for n in [1usize, 2, 4] {
        let keys: Vec<String> = ["global", "user:u1", "agent:a1", "provider:openai"][..n]
            .iter()
            .map(|s| s.to_string())
            .collect();
        group.bench_with_input(BenchmarkId::new("keys", n), &keys, |b, keys| {
            b.iter(|| rl.try_admit(black_box(keys), 1))
        });
    }

    let many: Vec<Vec<String>> = (0..1000)
        .map(|i| vec!["global".to_string(), format!("user:{}", i)])
        .collect();
    group.bench_function("1000_distinct_callers", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % many.len();
            rl.try_admit(black_box(&many[i]), 1)
        })
    });
    group.finish();
}

fn bench_breaker(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("openai:gpt-4o", CircuitBreakerConfig::default());
    c.bench_function("breaker_acquire_success", |b| {
        b.iter(|| {
            if let Ok(permit) = breaker.try_acquire() {
                permit.success();
            }
        })
    });
}

fn bench_orchestrated_call(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = rt.block_on(async {
        let mut cfg = ResilienceConfig::default();
        cfg.limiter.scopes.insert("global".into(), generous());
        Arc::new(ResilienceEngine::builder().config(cfg).build().unwrap())
    });
    let chain = FallbackChain::from_names(["openai:gpt-4o", "anthropic:claude-sonnet"]);
    let ctx = RequestContext::new().with_caller("bench");

    c.bench_function("engine_execute_first_target", |b| {
        b.to_async(&rt).iter(|| {
            let engine = Arc::clone(&engine);
            let chain = chain.clone();
            let ctx = ctx.clone();
            async move {
                engine
                    .execute(&ctx, &chain, |_| async { Ok(GenerationResponse::new("ok")) })
                    .await
                    .unwrap()
            }
        })
    });
}

criterion_group!(benches, bench_limiter, bench_breaker, bench_orchestrated_call);
criterion_main!(benches);
