//! 熔断器注册表：按目标名称惰性创建熔断器，并从共享配置读取阈值。
//!
//! One [`CircuitBreaker`] per target name, created on first use. Thresholds
//! come from the live [`SharedConfig`] on every lookup, so a reconfiguration
//! reaches existing breakers without resetting their state.

use crate::config::SharedConfig;
use crate::events::EventSink;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::resilience::store::StoreHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct BreakerRegistry {
    config: SharedConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    sink: Arc<dyn EventSink>,
    store: Option<StoreHandle>,
}

impl BreakerRegistry {
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
            breakers: RwLock::new(HashMap::new()),
            sink,
            store,
        }
    }

    /// Breaker for `target`, adopting the current configured thresholds.
    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        let cfg = self.config.load();
        let wanted = cfg.circuit_breaker.config_for(target);
        let existing = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned();
        if let Some(b) = existing {
            b.update_config(wanted);
            return b;
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        let b = map.entry(target.to_string()).or_insert_with(|| {
            tracing::debug!(target_name = %target, "creating circuit breaker");
            Arc::new(CircuitBreaker::with_observers(
                target,
                wanted.clone(),
                Arc::clone(&self.sink),
                self.store.clone(),
            ))
        });
        Arc::clone(b)
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.get(target)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshots of every known breaker, sorted by target.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all.iter().map(|b| b.snapshot()).collect()
    }

    /// Administrative reset. Returns false for an unknown target.
    pub fn reset(&self, target: &str) -> bool {
        match self.get(target) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    /// Operational override; creates the breaker if needed.
    pub fn force_state(&self, target: &str, state: CircuitState) {
        self.get_or_create(target).force_state(state);
    }

    /// State another process last published for `target`, if a shared store
    /// is configured and reachable.
    pub async fn fleet_state(&self, target: &str) -> Option<CircuitState> {
        self.store.as_ref()?.circuit_state(target).await
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::error_class::ErrorClass;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use crate::resilience::store::MemoryStore;
    use crate::telemetry::InMemoryEventSink;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_per_target_config_replaces_defaults() {
        let mut cfg = ResilienceConfig::default();
        cfg.circuit_breaker.defaults = CircuitBreakerConfig::default().with_failure_threshold(5);
        cfg.circuit_breaker.targets.insert(
            "openai:gpt".into(),
            CircuitBreakerConfig::default().with_failure_threshold(2),
        );
        let reg = BreakerRegistry::new(SharedConfig::new(cfg));
        assert_eq!(reg.get_or_create("openai:gpt").config().failure_threshold, 2);
        assert_eq!(reg.get_or_create("groq:llama").config().failure_threshold, 5);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_keeps_state() {
        let shared = SharedConfig::default();
        let reg = BreakerRegistry::new(shared.clone());
        let b = reg.get_or_create("a:m");
        b.record_failure(ErrorClass::ServerError, Duration::from_millis(5));

        let mut next = (*shared.load()).clone();
        next.circuit_breaker.defaults.failure_threshold = 2;
        shared.store(next).unwrap();

        let b = reg.get_or_create("a:m");
        assert_eq!(b.config().failure_threshold, 2);
        assert_eq!(b.snapshot().consecutive_failures, 1);
        b.record_failure(ErrorClass::ServerError, Duration::from_millis(5));
        assert_eq!(reg.state("a:m"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_operations() {
        let reg = BreakerRegistry::new(SharedConfig::default());
        assert!(!reg.reset("missing:model"));
        reg.force_state("a:m", CircuitState::Open);
        assert_eq!(reg.state("a:m"), CircuitState::Open);
        assert!(reg.reset("a:m"));
        let snap = &reg.snapshot()[0];
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.total_failures, 0);
        assert_eq!(snap.window_calls, 0);
        assert_eq!(reg.state("unknown:m"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transitions_are_published_to_the_store() {
        let sink = Arc::new(InMemoryEventSink::new(100));
        let store = StoreHandle::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(100),
            "test",
            sink.clone(),
        );
        let reg = BreakerRegistry::with_observers(SharedConfig::default(), sink.clone(), Some(store));
        reg.force_state("a:m", CircuitState::Open);
        let mut published = None;
        for _ in 0..50 {
            published = reg.fleet_state("a:m").await;
            if published.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(published, Some(CircuitState::Open));
        assert_eq!(sink.get_events_by_name("circuit_transition").len(), 1);
    }
}
