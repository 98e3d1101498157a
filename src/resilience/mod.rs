//! 弹性模块：多键限流、优先级排队、熔断器注册表与共享状态存储。
//!
//! # Resilience Primitives
//!
//! Admission control and failure isolation for model calls.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`bucket`] | Token bucket and request window per key |
//! | [`rate_limiter`] | Multi-key admission with priority queueing |
//! | [`circuit_breaker`] | Per-target state machine (closed / open / half-open) |
//! | [`breaker_registry`] | One breaker per target, created on first use |
//! | [`store`] | Optional shared store for fleet-wide counts and states |
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use ai_lib_resilience::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("openai:gpt-4o", config);
//! assert!(breaker.is_call_permitted());
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust,no_run
//! use ai_lib_resilience::config::{ResilienceConfig, SharedConfig};
//! use ai_lib_resilience::resilience::rate_limiter::{LimitConfig, RateLimiter};
//!
//! let mut config = ResilienceConfig::default();
//! config.limiter.scopes.insert("user".into(), LimitConfig::per_minute(60.0));
//! let limiter = RateLimiter::new(SharedConfig::new(config));
//! let decision = limiter.try_admit(&["user:alice".to_string()], 1);
//! assert!(decision.allowed);
//! ```

pub mod breaker_registry;
pub mod bucket;
pub mod circuit_breaker;
pub(crate) mod queue;
pub mod rate_limiter;
pub mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
