//! 弹性引擎：组合限流器、熔断器注册表与回退编排器的依赖注入根。
//!
//! [`ResilienceEngine`] owns one [`RateLimiter`], one [`BreakerRegistry`] and
//! the [`Orchestrator`] that uses both. It also runs the maintenance task
//! (queue draining and idle-key eviction) and exposes the snapshot and
//! administrative surface for operator tooling.

use crate::config::{ResilienceConfig, SharedConfig, StoreKind};
use crate::context::RequestContext;
use crate::events::EventSink;
use crate::orchestrator::{
    AdmissionGate, AttemptContext, ExecutionOutcome, FallbackChain, GenerationResponse,
    Orchestrator, Target,
};
use crate::resilience::breaker_registry::BreakerRegistry;
use crate::resilience::circuit_breaker::{CircuitSnapshot, CircuitState};
use crate::resilience::rate_limiter::{KeySnapshot, RateLimiter};
use crate::resilience::store::{MemoryStore, SharedStore, StoreHandle};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Observability snapshot of every live key and circuit.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub keys: Vec<KeySnapshot>,
    pub circuits: Vec<CircuitSnapshot>,
}

/// Admission gate backed by the engine's limiter.
struct LimiterGate {
    config: SharedConfig,
    limiter: Arc<RateLimiter>,
}

#[async_trait]
impl AdmissionGate for LimiterGate {
    async fn admit(&self, ctx: &RequestContext, target: &Target) -> Result<()> {
        let exempt = {
            let cfg = self.config.load();
            !cfg.limiter.enabled || cfg.limiter.is_exempt(ctx.operation.as_deref())
        };
        if exempt {
            return Ok(());
        }
        let keys = ctx.limit_keys(&target.provider);
        self.limiter
            .acquire(
                &keys,
                ctx.cost,
                ctx.priority,
                ctx.wait_for_admission,
                &ctx.cancel,
                Some(&ctx.request_id),
            )
            .await
            .map(|_| ())
    }
}

/// Builder for [`ResilienceEngine`].
pub struct ResilienceEngineBuilder {
    config: Option<ResilienceConfig>,
    config_path: Option<PathBuf>,
    watch: bool,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn SharedStore>>,
    maintenance: bool,
}

impl Default for ResilienceEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            config_path: None,
            watch: false,
            sink: crate::events::noop_sink(),
            store: None,
            maintenance: true,
        }
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load configuration from a YAML or JSON file (env overrides applied).
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Reload the config file on change. Requires `config_file`.
    pub fn watch_config(mut self, enable: bool) -> Self {
        self.watch = enable;
        self
    }

    /// Inject an event sink. Default is a no-op sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use this store instead of the one described by `shared_store`.
    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Disable the background task; callers then drive
    /// [`ResilienceEngine::run_maintenance`] themselves.
    pub fn background_maintenance(mut self, enable: bool) -> Self {
        self.maintenance = enable;
        self
    }

    pub fn build(self) -> Result<ResilienceEngine> {
        let cfg = match (&self.config_path, self.config) {
            (Some(path), _) => ResilienceConfig::load(path)?,
            (None, Some(cfg)) => {
                cfg.validate()?;
                cfg
            }
            (None, None) => {
                let mut cfg = ResilienceConfig::default();
                cfg.apply_env_overrides();
                cfg.validate()?;
                cfg
            }
        };

        let store = match self.store {
            Some(s) => Some((s, Duration::from_millis(50), "ai-resilience".to_string())),
            None => match &cfg.shared_store {
                Some(settings) => Some((
                    build_store(settings)?,
                    Duration::from_millis(settings.timeout_ms.max(1)),
                    settings.key_prefix.clone(),
                )),
                None => None,
            },
        };
        let store = store.map(|(s, timeout, prefix)| {
            tracing::info!(store = s.name(), "shared store enabled");
            StoreHandle::new(s, timeout, prefix, Arc::clone(&self.sink))
        });

        let config = SharedConfig::new(cfg);
        let limiter = Arc::new(RateLimiter::with_observers(
            config.clone(),
            Arc::clone(&self.sink),
            store.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::with_observers(
            config.clone(),
            Arc::clone(&self.sink),
            store,
        ));
        let gate = Arc::new(LimiterGate {
            config: config.clone(),
            limiter: Arc::clone(&limiter),
        });
        let orchestrator = Orchestrator::new(config.clone(), Arc::clone(&breakers))
            .with_gate(gate)
            .with_sink(Arc::clone(&self.sink));

        let engine = ResilienceEngine {
            config,
            limiter,
            breakers,
            orchestrator,
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
            #[cfg(feature = "hot_reload")]
            watcher: Mutex::new(None),
        };
        if self.maintenance {
            engine.start_maintenance();
        }
        #[cfg(feature = "hot_reload")]
        if self.watch {
            if let Some(path) = &self.config_path {
                engine.watch_config(path)?;
            }
        }
        #[cfg(not(feature = "hot_reload"))]
        if self.watch {
            tracing::warn!("config watching requested but the hot_reload feature is disabled");
        }
        Ok(engine)
    }
}

fn build_store(settings: &crate::config::SharedStoreSettings) -> Result<Arc<dyn SharedStore>> {
    match settings.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "http_store")]
        StoreKind::Http => {
            let url = settings.url.as_deref().unwrap_or_default();
            Ok(Arc::new(crate::resilience::store::HttpStore::new(
                url,
                Duration::from_millis(settings.timeout_ms.max(1)),
            )?))
        }
        #[cfg(not(feature = "http_store"))]
        StoreKind::Http => Err(Error::configuration_with_context(
            "http shared store requires the http_store feature",
            ErrorContext::new()
                .with_field_path("shared_store.kind")
                .with_source("engine"),
        )),
    }
}

/// Dependency-injection root for the resilience core.
pub struct ResilienceEngine {
    config: SharedConfig,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "hot_reload")]
    watcher: Mutex<Option<crate::config::ConfigWatcher>>,
}

impl ResilienceEngine {
    pub fn builder() -> ResilienceEngineBuilder {
        ResilienceEngineBuilder::new()
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `call` against `chain` with admission control, circuit breaking,
    /// retries and fallback.
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
        self.orchestrator.execute(ctx, chain, call).await
    }

    /// Like [`execute`](Self::execute), with the chain configured for the
    /// context's agent, else its caller, else the default chain.
    pub async fn execute_configured<F, Fut>(
        &self,
        ctx: &RequestContext,
        call: F,
    ) -> Result<ExecutionOutcome>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<GenerationResponse>>,
    {
        let chain = self
            .config
            .load()
            .chains
            .resolve(ctx.agent_id.as_deref(), ctx.caller_id.as_deref())
            .ok_or_else(|| {
                Error::configuration_with_context(
                    "no fallback chain configured for request",
                    ErrorContext::new()
                        .with_field_path("chains")
                        .with_source("engine")
                        .with_request_id(ctx.request_id.clone()),
                )
            })?;
        self.orchestrator.execute(ctx, &chain, call).await
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            keys: self.limiter.snapshot(),
            circuits: self.breakers.snapshot(),
        }
    }

    pub fn reset_circuit(&self, target: &str) -> bool {
        self.breakers.reset(target)
    }

    pub fn force_circuit_state(&self, target: &str, state: CircuitState) {
        self.breakers.force_state(target, state);
    }

    pub fn reset_limit_key(&self, key: &str) -> bool {
        self.limiter.reset_key(key)
    }

    /// Validate and apply a new configuration. Existing keys and breakers
    /// adopt it on their next use.
    pub fn reconfigure(&self, config: ResilienceConfig) -> Result<()> {
        self.config.store(config)?;
        self.limiter.drain_queues();
        Ok(())
    }

    #[cfg(feature = "hot_reload")]
    pub fn watch_config(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let watcher = crate::config::ConfigWatcher::watch(path, self.config.clone())?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
        Ok(())
    }

    /// One maintenance pass: drain queues and evict idle keys.
    pub fn run_maintenance(&self) -> usize {
        let admitted = self.limiter.drain_queues();
        let idle = self.config.load().limiter.idle_eviction();
        self.limiter.evict_idle(idle);
        admitted
    }

    fn start_maintenance(&self) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime; queue draining left to the caller");
            return;
        };
        let limiter: Weak<RateLimiter> = Arc::downgrade(&self.limiter);
        let config = self.config.clone();
        let token = self.shutdown.clone();
        let handle = rt.spawn(async move {
            let mut last_evict = Instant::now();
            loop {
                let (interval, idle) = {
                    let cfg = config.load();
                    (cfg.limiter.drain_interval(), cfg.limiter.idle_eviction())
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.drain_queues();
                let evict_every = (idle / 4).max(Duration::from_secs(1));
                if last_evict.elapsed() >= evict_every {
                    limiter.evict_idle(idle);
                    last_evict = Instant::now();
                }
            }
            tracing::debug!("resilience maintenance task stopped");
        });
        *self.maintenance.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop background work and wait for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        #[cfg(feature = "hot_reload")]
        if let Some(w) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            w.stop();
        }
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("resilience engine shut down");
    }
}

impl Drop for ResilienceEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Priority;
    use crate::resilience::rate_limiter::LimitConfig;
    use crate::telemetry::InMemoryEventSink;

    fn limited_config(burst: u32) -> ResilienceConfig {
        let mut cfg = ResilienceConfig::default();
        cfg.limiter.scopes.insert(
            "provider".into(),
            LimitConfig::default()
                .with_burst(burst)
                .with_queue(10, Duration::from_secs(5)),
        );
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_denial_falls_back_to_next_provider() {
        let sink = Arc::new(InMemoryEventSink::new(100));
        let engine = ResilienceEngine::builder()
            .config(limited_config(1))
            .event_sink(sink.clone())
            .build()
            .unwrap();
        let chain = FallbackChain::from_names(["openai:gpt", "groq:llama"]);
        let ctx = RequestContext::new();
        for expected in ["openai:gpt", "groq:llama"] {
            let out = engine
                .execute(&ctx, &chain, |_| async { Ok(GenerationResponse::new("ok")) })
                .await
                .unwrap();
            assert_eq!(out.target_used, expected);
        }
        assert_eq!(sink.get_events_by_name("admission_denied").len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exempt_operation_bypasses_limits() {
        let mut cfg = limited_config(1);
        cfg.limiter.exempt_operations.push("health_check".into());
        let engine = ResilienceEngine::builder().config(cfg).build().unwrap();
        let chain = FallbackChain::from_names(["openai:gpt"]);
        let ctx = RequestContext::new().with_operation("health_check");
        for _ in 0..5 {
            engine
                .execute(&ctx, &chain, |_| async { Ok(GenerationResponse::new("ok")) })
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_admission_is_drained_by_maintenance() {
        let engine = ResilienceEngine::builder()
            .config(limited_config(1))
            .build()
            .unwrap();
        let chain = FallbackChain::from_names(["openai:gpt"]);
        let ctx = RequestContext::new()
            .wait_for_admission(true)
            .with_priority(Priority::High);
        let ok = |_: AttemptContext| async { Ok(GenerationResponse::new("ok")) };
        engine.execute(&ctx, &chain, ok).await.unwrap();
        // waits for refill (one token per second) then the drainer admits it
        let start = Instant::now();
        engine.execute(&ctx, &chain, ok).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_chain_resolution() {
        let mut cfg = ResilienceConfig::default();
        cfg.chains.default = vec![Target::new("openai", "gpt")];
        cfg.chains
            .agents
            .insert("coder".into(), vec![Target::new("anthropic", "claude")]);
        let engine = ResilienceEngine::builder()
            .config(cfg)
            .background_maintenance(false)
            .build()
            .unwrap();
        let out = engine
            .execute_configured(&RequestContext::new().with_agent("coder"), |a| async move {
                Ok(GenerationResponse::new(a.target.name()))
            })
            .await
            .unwrap();
        assert_eq!(out.content(), "anthropic:claude");
        let out = engine
            .execute_configured(&RequestContext::new(), |a| async move {
                Ok(GenerationResponse::new(a.target.name()))
            })
            .await
            .unwrap();
        assert_eq!(out.content(), "openai:gpt");
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_config() {
        let engine = ResilienceEngine::builder()
            .background_maintenance(false)
            .build()
            .unwrap();
        let mut bad = ResilienceConfig::default();
        bad.limiter
            .scopes
            .insert("global".into(), LimitConfig::default().with_burst(0));
        assert!(matches!(
            engine.reconfigure(bad),
            Err(Error::Configuration { .. })
        ));
        assert!(engine.config().load().limiter.scopes.is_empty());
    }
}
