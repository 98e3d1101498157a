//! 配置模块：限流、熔断、重试与回退链配置，支持 YAML/JSON、环境变量覆盖与热更新。
//!
//! Configuration for the resilience core.
//!
//! Every field has a serde default so partial documents are valid. Durations
//! are integer `*_ms` fields. The live configuration is held in a
//! [`SharedConfig`] (`ArcSwap`); the limiter and breaker registry resolve their
//! per-scope / per-target settings from it on every call, so swapping the
//! config reconfigures running state without a restart.

use crate::context::Scope;
use crate::orchestrator::chain::{FallbackChain, Target};
use crate::orchestrator::policy::RetryPolicy;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::LimitConfig;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_drain_interval_ms() -> u64 {
    50
}

fn default_idle_eviction_ms() -> u64 {
    10 * 60 * 1000
}

/// Admission-control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Limits per scope kind (`global`, `user`, `agent`, `workspace`,
    /// `provider`, `operation`). A scope with no entry is not limited.
    #[serde(default)]
    pub scopes: BTreeMap<String, LimitConfig>,
    /// Limits for individual keys (e.g. `user:vip-42`), overriding the scope entry.
    #[serde(default)]
    pub overrides: BTreeMap<String, LimitConfig>,
    /// Operation tags that bypass admission control.
    #[serde(default)]
    pub exempt_operations: Vec<String>,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_idle_eviction_ms")]
    pub idle_eviction_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scopes: BTreeMap::new(),
            overrides: BTreeMap::new(),
            exempt_operations: Vec::new(),
            drain_interval_ms: default_drain_interval_ms(),
            idle_eviction_ms: default_idle_eviction_ms(),
        }
    }
}

impl LimiterSettings {
    /// Limit that applies to `key`, if any.
    pub fn limit_for(&self, key: &str) -> Option<&LimitConfig> {
        if let Some(limit) = self.overrides.get(key) {
            return Some(limit);
        }
        let scope = key.split(':').next().unwrap_or(key);
        self.scopes.get(scope)
    }

    pub fn is_exempt(&self, operation: Option<&str>) -> bool {
        operation
            .map(|op| self.exempt_operations.iter().any(|e| e == op))
            .unwrap_or(false)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }
}

/// Circuit-breaker settings: defaults plus per-target replacements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default)]
    pub defaults: CircuitBreakerConfig,
    /// Full per-target configs keyed by `provider:model`.
    #[serde(default)]
    pub targets: BTreeMap<String, CircuitBreakerConfig>,
}

impl BreakerSettings {
    pub fn config_for(&self, target: &str) -> &CircuitBreakerConfig {
        self.targets.get(target).unwrap_or(&self.defaults)
    }
}

/// Fallback chains keyed by agent and caller identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainSettings {
    #[serde(default)]
    pub default: Vec<Target>,
    #[serde(default)]
    pub agents: BTreeMap<String, Vec<Target>>,
    #[serde(default)]
    pub callers: BTreeMap<String, Vec<Target>>,
}

impl ChainSettings {
    /// Agent chain first, then caller chain, then the default chain.
    pub fn resolve(&self, agent_id: Option<&str>, caller_id: Option<&str>) -> Option<FallbackChain> {
        let targets = agent_id
            .and_then(|a| self.agents.get(a))
            .or_else(|| caller_id.and_then(|c| self.callers.get(c)))
            .or(if self.default.is_empty() {
                None
            } else {
                Some(&self.default)
            })?;
        Some(FallbackChain::new(targets.clone()))
    }

    fn all(&self) -> impl Iterator<Item = (String, &Vec<Target>)> {
        std::iter::once(("chains.default".to_string(), &self.default))
            .chain(
                self.agents
                    .iter()
                    .map(|(k, v)| (format!("chains.agents.{}", k), v)),
            )
            .chain(
                self.callers
                    .iter()
                    .map(|(k, v)| (format!("chains.callers.{}", k), v)),
            )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Http,
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    "ai-resilience".to_string()
}

/// Optional fleet-wide store mirroring limiter and circuit state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedStoreSettings {
    #[serde(default)]
    pub kind: StoreKind,
    /// Base URL for the HTTP store.
    #[serde(default)]
    pub url: Option<String>,
    /// Upper bound on any single store call before degrading to local limits.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for SharedStoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: None,
            timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub limiter: LimiterSettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub chains: ChainSettings,
    /// Overall deadline for one logical request across the whole chain walk.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub shared_store: Option<SharedStoreSettings>,
}

impl ResilienceConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load by file extension (`.json`, otherwise YAML), apply `AI_RESILIENCE_*`
    /// environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Apply overrides from the process environment.
    ///
    /// - `AI_RESILIENCE_RPS` / `AI_RESILIENCE_RPM` (global limit)
    /// - `AI_RESILIENCE_BREAKER_FAILURE_THRESHOLD`
    /// - `AI_RESILIENCE_BREAKER_COOLDOWN_MS`
    /// - `AI_RESILIENCE_MAX_RETRIES`
    /// - `AI_RESILIENCE_REQUEST_TIMEOUT_MS`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|k| std::env::var(k).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<f64>().ok());

        let rps = num("AI_RESILIENCE_RPS").filter(|v| v.is_finite() && *v > 0.0);
        let rpm = num("AI_RESILIENCE_RPM").filter(|v| v.is_finite() && *v > 0.0);
        if let Some(rps) = rps {
            self.limiter
                .scopes
                .insert(Scope::Global.name().to_string(), LimitConfig::per_second(rps));
        } else if let Some(rpm) = rpm {
            self.limiter
                .scopes
                .insert(Scope::Global.name().to_string(), LimitConfig::per_minute(rpm));
        }

        if let Some(t) = num("AI_RESILIENCE_BREAKER_FAILURE_THRESHOLD") {
            self.circuit_breaker.defaults.failure_threshold = (t as u32).max(1);
        }
        if let Some(ms) = num("AI_RESILIENCE_BREAKER_COOLDOWN_MS") {
            self.circuit_breaker.defaults.reset_timeout_ms = (ms as u64).max(1);
        }
        if let Some(n) = num("AI_RESILIENCE_MAX_RETRIES") {
            self.retry.max_retries = n.max(0.0) as u32;
        }
        if let Some(ms) = num("AI_RESILIENCE_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = Some(ms.max(0.0) as u64).filter(|v| *v > 0);
        }
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.drain_interval_ms == 0 {
            return Err(invalid(
                "limiter.drain_interval_ms",
                "drain interval must be positive",
                "0",
            ));
        }
        for (name, limit) in &self.limiter.scopes {
            if Scope::parse(name).is_none() {
                return Err(invalid(
                    format!("limiter.scopes.{}", name),
                    "unknown limiter scope",
                    "expected one of global, user, agent, workspace, provider, operation",
                ));
            }
            limit.validate(&format!("limiter.scopes.{}", name))?;
        }
        for (key, limit) in &self.limiter.overrides {
            let scope = key.split(':').next().unwrap_or(key);
            if Scope::parse(scope).is_none() {
                return Err(invalid(
                    format!("limiter.overrides.{}", key),
                    "override key must start with a known scope",
                    key.clone(),
                ));
            }
            limit.validate(&format!("limiter.overrides.{}", key))?;
        }

        self.circuit_breaker
            .defaults
            .validate("circuit_breaker.defaults")?;
        for (target, cfg) in &self.circuit_breaker.targets {
            cfg.validate(&format!("circuit_breaker.targets.{}", target))?;
        }

        self.retry.validate("retry")?;

        for (path, targets) in self.chains.all() {
            let mut seen = HashSet::new();
            for (i, t) in targets.iter().enumerate() {
                let field = format!("{}[{}]", path, i);
                if t.provider.trim().is_empty() || t.model.trim().is_empty() {
                    return Err(invalid(field, "target needs provider and model", t.name()));
                }
                if t.timeout_ms == Some(0) {
                    return Err(invalid(field, "target timeout must be positive", "0"));
                }
                if !seen.insert(t.name()) {
                    return Err(invalid(field, "duplicate target in chain", t.name()));
                }
            }
        }

        if let Some(store) = &self.shared_store {
            if store.kind == StoreKind::Http && store.url.as_deref().map_or(true, str::is_empty) {
                return Err(invalid(
                    "shared_store.url",
                    "http store requires a url",
                    "missing",
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn invalid(
    field: impl Into<String>,
    message: impl Into<String>,
    details: impl Into<String>,
) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("config_validator"),
    )
}

/// Hot-swappable handle to the live configuration.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<ResilienceConfig>>,
}

impl SharedConfig {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Cheap snapshot; hold it for the duration of one request.
    pub fn load(&self) -> Arc<ResilienceConfig> {
        self.inner.load_full()
    }

    /// Validate and publish a new configuration.
    pub fn store(&self, config: ResilienceConfig) -> Result<()> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        tracing::info!("resilience configuration updated");
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("config", &self.inner.load())
            .finish()
    }
}

#[cfg(feature = "hot_reload")]
pub use watcher::ConfigWatcher;

#[cfg(feature = "hot_reload")]
mod watcher {
    use super::{ResilienceConfig, SharedConfig};
    use crate::{Error, ErrorContext, Result};
    use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Watches a config file and publishes valid edits into a [`SharedConfig`].
    ///
    /// Invalid edits are logged and ignored; the previous config stays live.
    pub struct ConfigWatcher {
        _watcher: RecommendedWatcher,
        shutdown: CancellationToken,
        path: PathBuf,
    }

    impl ConfigWatcher {
        pub fn watch(path: impl AsRef<Path>, shared: SharedConfig) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let file_name = path.file_name().map(|n| n.to_os_string());
            let (tx, mut rx) = mpsc::channel::<()>(16);

            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                match res {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        let relevant = event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                        if relevant {
                            let _ = tx.try_send(());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "config watch error"),
                }
            })
            .map_err(watch_error)?;

            let watch_path = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            watcher
                .watch(watch_path, RecursiveMode::NonRecursive)
                .map_err(watch_error)?;
            tracing::info!(path = %path.display(), "watching resilience config");

            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            let task_path = path.clone();
            tokio::spawn(async move {
                let debounce = Duration::from_millis(100);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        msg = rx.recv() => {
                            if msg.is_none() {
                                break;
                            }
                            // editors emit bursts of events for one save
                            tokio::time::sleep(debounce).await;
                            while rx.try_recv().is_ok() {}
                            match ResilienceConfig::load(&task_path)
                                .and_then(|cfg| shared.store(cfg))
                            {
                                Ok(()) => tracing::info!(path = %task_path.display(), "config reloaded"),
                                Err(e) => tracing::warn!(path = %task_path.display(), error = %e, "ignoring invalid config edit"),
                            }
                        }
                    }
                }
                tracing::debug!("config watcher stopped");
            });

            Ok(Self {
                _watcher: watcher,
                shutdown,
                path,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn stop(&self) {
            self.shutdown.cancel();
        }
    }

    impl Drop for ConfigWatcher {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn watch_error(e: notify::Error) -> Error {
        Error::runtime_with_context(
            format!("failed to watch config file: {}", e),
            ErrorContext::new().with_source("config_watcher"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const SAMPLE: &str = r#"
limiter:
  scopes:
    global:
      max_burst: 100
      tokens_per_interval: 100
      interval_ms: 60000
    user:
      max_burst: 5
      tokens_per_interval: 5
      interval_ms: 60000
      max_requests_per_window: 5
  overrides:
    "user:vip":
      max_burst: 50
      tokens_per_interval: 50
  exempt_operations: [health_check]
circuit_breaker:
  defaults:
    failure_threshold: 3
  targets:
    "openai:gpt-4o":
      failure_threshold: 2
      reset_timeout_ms: 1000
retry:
  max_retries: 1
chains:
  default:
    - { provider: openai, model: gpt-4o }
    - { provider: anthropic, model: claude, max_retries: 0 }
  agents:
    support:
      - { provider: groq, model: llama, timeout_ms: 5000 }
request_timeout_ms: 20000
"#;

    #[test]
    fn test_parse_partial_yaml() {
        let cfg = ResilienceConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.limiter.limit_for("user:42").unwrap().max_burst, 5);
        assert_eq!(cfg.limiter.limit_for("user:vip").unwrap().max_burst, 50);
        assert!(cfg.limiter.limit_for("agent:x").is_none());
        assert!(cfg.limiter.is_exempt(Some("health_check")));
        assert!(!cfg.limiter.is_exempt(None));
        assert_eq!(cfg.circuit_breaker.config_for("openai:gpt-4o").failure_threshold, 2);
        assert_eq!(cfg.circuit_breaker.config_for("groq:llama").failure_threshold, 3);
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_chain_resolution_order() {
        let cfg = ResilienceConfig::from_yaml_str(SAMPLE).unwrap();
        let support = cfg.chains.resolve(Some("support"), None).unwrap();
        assert_eq!(support.targets()[0].name(), "groq:llama");
        let fallback = cfg.chains.resolve(Some("unknown"), Some("nobody")).unwrap();
        assert_eq!(fallback.len(), 2);
        assert!(ChainSettings::default().resolve(None, None).is_none());
    }

    #[test]
    fn test_validate_rejects_duplicate_targets() {
        let mut cfg = ResilienceConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.chains.default.push(Target::new("openai", "gpt-4o"));
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("chains.default[2]")
        );
    }

    #[test]
    fn test_validate_rejects_unknown_scope_and_bad_rate() {
        let mut cfg = ResilienceConfig::default();
        cfg.limiter
            .scopes
            .insert("tenant".into(), LimitConfig::default());
        assert!(cfg.validate().is_err());

        let mut cfg = ResilienceConfig::default();
        cfg.circuit_breaker.defaults.failure_rate_threshold = 150.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("circuit_breaker.defaults.failure_rate_threshold"));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = ResilienceConfig::default();
        cfg.apply_overrides_from(|k| match k {
            "AI_RESILIENCE_RPM" => Some("120".into()),
            "AI_RESILIENCE_BREAKER_FAILURE_THRESHOLD" => Some("7".into()),
            "AI_RESILIENCE_MAX_RETRIES" => Some("4".into()),
            "AI_RESILIENCE_REQUEST_TIMEOUT_MS" => Some("15000".into()),
            _ => None,
        });
        let global = cfg.limiter.limit_for("global").unwrap();
        assert_eq!(global.max_burst, 120);
        assert_eq!(global.interval_ms, 60_000);
        assert_eq!(cfg.circuit_breaker.defaults.failure_threshold, 7);
        assert_eq!(cfg.retry.max_retries, 4);
        assert_eq!(cfg.request_timeout_ms, Some(15_000));
    }

    #[test]
    fn test_json_and_shared_store() {
        let cfg = ResilienceConfig::from_json_str(
            r#"{"shared_store": {"kind": "http"}, "retry": {"base_delay_ms": 10}}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());

        let shared = SharedConfig::default();
        assert!(shared.store(cfg).is_err());
        assert!(shared.load().shared_store.is_none());
    }
}
