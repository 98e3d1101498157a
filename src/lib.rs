//! # ai-lib-resilience
//!
//! 面向多厂商大模型调用的弹性核心：准入限流、熔断与回退链编排。
//!
//! Resilience core for multi-provider LLM calls. It sits between an
//! application and its model providers: admits or queues requests under
//! configurable limits, walks a ranked chain of `(provider, model)` targets,
//! retries transient failures, stops calling targets that are clearly broken
//! and returns the first success or one well-classified error.
//!
//! ## Overview
//!
//! - **Rate limiter**: per-key token bucket plus request window, checked
//!   atomically across all keys of a request, with a per-scope priority queue
//! - **Circuit breaker registry**: one state machine per target with lazy and
//!   timer-driven half-open probing
//! - **Fallback orchestrator**: ordered chain walk with jittered exponential
//!   backoff, breaker-aware skipping and an error taxonomy that decides between
//!   retry, fallback and abort
//!
//! The core never builds provider payloads; callers hand it a generation
//! function that performs one call to one target.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_lib_resilience::{
//!     FallbackChain, GenerationResponse, RequestContext, ResilienceEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ai_lib_resilience::Result<()> {
//!     let engine = ResilienceEngine::builder()
//!         .config_file("resilience.yaml")
//!         .build()?;
//!
//!     let chain = FallbackChain::from_names(["openai:gpt-4o", "anthropic:claude-sonnet"]);
//!     let ctx = RequestContext::new().with_caller("user-42").with_agent("support");
//!     let outcome = engine
//!         .execute(&ctx, &chain, |attempt| async move {
//!             // call attempt.target with attempt.idempotency_key here
//!             Ok(GenerationResponse::new("hello"))
//!         })
//!         .await?;
//!     println!("served by {} after {} retries", outcome.target_used, outcome.retries);
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`engine`] | Dependency-injection root, maintenance task, admin operations |
//! | [`orchestrator`] | Fallback chains, retry policy, chain walk |
//! | [`resilience`] | Token buckets, limiter, priority queue, circuit breakers, shared store |
//! | [`config`] | YAML/JSON configuration, env overrides, hot reload |
//! | [`context`] | Per-request identity, priority, cancellation |
//! | [`error`] / [`error_class`] | Error taxonomy and failure classification |
//! | [`events`] / [`telemetry`] | Observability events and sinks |

pub mod config;
pub mod context;
pub mod engine;
pub mod error_class;
pub mod events;
pub mod orchestrator;
pub mod resilience;
pub mod telemetry;

pub use config::{ResilienceConfig, SharedConfig};
pub use context::{Priority, RequestContext, Scope};
pub use engine::{EngineSnapshot, ResilienceEngine, ResilienceEngineBuilder};
pub use error_class::ErrorClass;
pub use events::{EventRecord, EventSink, ResilienceEvent};
pub use orchestrator::{
    AttemptContext, AttemptRecord, ExecutionOutcome, FallbackChain, GenerationResponse,
    RetryPolicy, Target,
};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use resilience::rate_limiter::{AdmitDecision, LimitConfig, RateLimiter};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind};
