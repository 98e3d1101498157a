//! 回退编排模块：目标链、重试策略与执行循环。
//!
//! The fallback orchestrator: walks an ordered [`FallbackChain`], skips
//! targets whose circuit is open, retries transient failures with jittered
//! exponential backoff and aborts on failures that no target could fix.
//!
//! ```rust,no_run
//! use ai_lib_resilience::config::SharedConfig;
//! use ai_lib_resilience::context::RequestContext;
//! use ai_lib_resilience::orchestrator::{FallbackChain, GenerationResponse, Orchestrator};
//! use ai_lib_resilience::resilience::breaker_registry::BreakerRegistry;
//! use std::sync::Arc;
//!
//! # async fn run() -> ai_lib_resilience::Result<()> {
//! let config = SharedConfig::default();
//! let breakers = Arc::new(BreakerRegistry::new(config.clone()));
//! let orchestrator = Orchestrator::new(config, breakers);
//! let chain = FallbackChain::from_names(["openai:gpt-4o", "anthropic:claude-sonnet"]);
//! let outcome = orchestrator
//!     .execute(&RequestContext::new(), &chain, |attempt| async move {
//!         Ok(GenerationResponse::new(format!("answered by {}", attempt.target)))
//!     })
//!     .await?;
//! println!("{} after {} retries", outcome.target_used, outcome.retries);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod execution;
pub mod policy;

pub use chain::{FallbackChain, Target, TargetId};
pub use execution::{
    AdmissionGate, AttemptContext, AttemptOutcome, AttemptRecord, ExecutionOutcome,
    GenerationResponse, Orchestrator, SkipReason, TriedTarget, Usage,
};
pub use policy::{Decision, RetryPolicy};
