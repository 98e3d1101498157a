//! Shared store backends for approximate fleet-wide limiting.
//!
//! The store is best-effort: every call is bounded by a short timeout and any
//! failure degrades to process-local limiting. It is never used for locking.

use crate::events::{EventRecord, EventSink, ResilienceEvent};
use crate::resilience::circuit_breaker::CircuitState;
use crate::resilience::lock;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Count one request against `key` in the current `window`; returns the
    /// fleet-wide count after the increment.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64>;
    /// Fleet-wide count for `key` in the current `window`.
    async fn window_count(&self, key: &str, window: Duration) -> Result<u64>;
    async fn clear_window(&self, key: &str) -> Result<()>;
    async fn publish_circuit(&self, target: &str, state: CircuitState) -> Result<()>;
    async fn circuit_state(&self, target: &str) -> Result<Option<CircuitState>>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started: Instant,
    window: Duration,
    count: u64,
}

impl WindowCounter {
    fn roll(&mut self, now: Instant, window: Duration) {
        if window != self.window || now.saturating_duration_since(self.started) >= window {
            self.started = now;
            self.window = window;
            self.count = 0;
        }
    }
}

/// In-process store; the default for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, WindowCounter>>,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let counter = windows.entry(key.to_string()).or_insert(WindowCounter {
            started: now,
            window,
            count: 0,
        });
        counter.roll(now, window);
        counter.count += 1;
        Ok(counter.count)
    }

    async fn window_count(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        Ok(match windows.get_mut(key) {
            Some(counter) => {
                counter.roll(now, window);
                counter.count
            }
            None => 0,
        })
    }

    async fn clear_window(&self, key: &str) -> Result<()> {
        lock(&self.windows).remove(key);
        Ok(())
    }

    async fn publish_circuit(&self, target: &str, state: CircuitState) -> Result<()> {
        lock(&self.circuits).insert(target.to_string(), state);
        Ok(())
    }

    async fn circuit_state(&self, target: &str) -> Result<Option<CircuitState>> {
        Ok(lock(&self.circuits).get(target).copied())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "http_store")]
pub use http::HttpStore;

#[cfg(feature = "http_store")]
mod http {
    use super::SharedStore;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use url::Url;

    #[derive(Deserialize)]
    struct CountBody {
        count: u64,
    }

    #[derive(Serialize, Deserialize)]
    struct CircuitBody {
        state: CircuitState,
    }

    /// Store reached over a small REST API:
    ///
    /// - `POST {base}/v1/windows/{key}/incr?window_ms=N` -> `{"count": n}`
    /// - `GET {base}/v1/windows/{key}?window_ms=N` -> `{"count": n}`
    /// - `DELETE {base}/v1/windows/{key}`
    /// - `PUT {base}/v1/circuits/{target}` with `{"state": "open"}`
    /// - `GET {base}/v1/circuits/{target}` -> `{"state": ...}` or 404
    pub struct HttpStore {
        client: reqwest::Client,
        base: Url,
    }

    impl HttpStore {
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            let base = Url::parse(base_url).map_err(|e| {
                crate::config::invalid("shared_store.url", "invalid store url", e.to_string())
            })?;
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::store("http", e.to_string()))?;
            Ok(Self { client, base })
        }

        fn url(&self, segments: &[&str]) -> Result<Url> {
            let mut url = self.base.clone();
            url.path_segments_mut()
                .map_err(|_| Error::store("http", "store url cannot be a base"))?
                .pop_if_empty()
                .extend(segments);
            Ok(url)
        }

        async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
            let resp = req
                .send()
                .await
                .map_err(|e| Error::store("http", e.to_string()))?;
            Ok(resp)
        }

        async fn count(&self, resp: reqwest::Response) -> Result<u64> {
            let status = resp.status();
            if !status.is_success() {
                return Err(Error::store("http", format!("unexpected status {}", status)));
            }
            let body: CountBody = resp
                .json()
                .await
                .map_err(|e| Error::store("http", e.to_string()))?;
            Ok(body.count)
        }
    }

    #[async_trait]
    impl SharedStore for HttpStore {
        async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
            let mut url = self.url(&["v1", "windows", key, "incr"])?;
            url.query_pairs_mut()
                .append_pair("window_ms", &window.as_millis().to_string());
            let resp = self.send(self.client.post(url)).await?;
            self.count(resp).await
        }

        async fn window_count(&self, key: &str, window: Duration) -> Result<u64> {
            let mut url = self.url(&["v1", "windows", key])?;
            url.query_pairs_mut()
                .append_pair("window_ms", &window.as_millis().to_string());
            let resp = self.send(self.client.get(url)).await?;
            self.count(resp).await
        }

        async fn clear_window(&self, key: &str) -> Result<()> {
            let url = self.url(&["v1", "windows", key])?;
            let resp = self.send(self.client.delete(url)).await?;
            if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
                Ok(())
            } else {
                Err(Error::store("http", format!("unexpected status {}", resp.status())))
            }
        }

        async fn publish_circuit(&self, target: &str, state: CircuitState) -> Result<()> {
            let url = self.url(&["v1", "circuits", target])?;
            let resp = self
                .send(self.client.put(url).json(&CircuitBody { state }))
                .await?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(Error::store("http", format!("unexpected status {}", resp.status())))
            }
        }

        async fn circuit_state(&self, target: &str) -> Result<Option<CircuitState>> {
            let url = self.url(&["v1", "circuits", target])?;
            let resp = self.send(self.client.get(url)).await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                return Err(Error::store("http", format!("unexpected status {}", resp.status())));
            }
            let body: CircuitBody = resp
                .json()
                .await
                .map_err(|e| Error::store("http", e.to_string()))?;
            Ok(Some(body.state))
        }

        fn name(&self) -> &'static str {
            "http"
        }
    }
}

/// A store plus the timeout and key prefix the core applies to every call.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn SharedStore>,
    timeout: Duration,
    prefix: String,
    sink: Arc<dyn EventSink>,
}

impl StoreHandle {
    pub fn new(
        store: Arc<dyn SharedStore>,
        timeout: Duration,
        prefix: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            timeout,
            prefix: prefix.into(),
            sink,
        }
    }

    pub fn name(&self) -> &'static str {
        self.store.name()
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:window:{}", self.prefix, key)
    }

    fn circuit_key(&self, target: &str) -> String {
        format!("{}:circuit:{}", self.prefix, target)
    }

    /// Run a store call under the timeout; failures are reported and become `None`.
    async fn guarded<T, F>(&self, op: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                self.degraded(format!("{} failed: {}", op, e));
                None
            }
            Err(_) => {
                self.degraded(format!("{} timed out after {}ms", op, self.timeout.as_millis()));
                None
            }
        }
    }

    fn degraded(&self, message: String) {
        self.sink.emit(EventRecord::new(ResilienceEvent::StoreDegraded {
            store: self.store.name().to_string(),
            message,
        }));
    }

    pub async fn window_count(&self, key: &str, window: Duration) -> Option<u64> {
        let k = self.window_key(key);
        self.guarded("window_count", self.store.window_count(&k, window))
            .await
    }

    pub async fn incr_window(&self, key: &str, window: Duration) -> Option<u64> {
        let k = self.window_key(key);
        self.guarded("incr_window", self.store.incr_window(&k, window))
            .await
    }

    pub async fn clear_window(&self, key: &str) {
        let k = self.window_key(key);
        self.guarded("clear_window", self.store.clear_window(&k))
            .await;
    }

    pub async fn publish_circuit(&self, target: &str, state: CircuitState) {
        let k = self.circuit_key(target);
        self.guarded("publish_circuit", self.store.publish_circuit(&k, state))
            .await;
    }

    pub async fn circuit_state(&self, target: &str) -> Option<CircuitState> {
        let k = self.circuit_key(target);
        self.guarded("circuit_state", self.store.circuit_state(&k))
            .await
            .flatten()
    }

    /// Fire-and-forget; does nothing outside a tokio runtime.
    pub fn spawn<F>(&self, f: impl FnOnce(StoreHandle) -> F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(f(self.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryEventSink;

    struct FailingStore;

    #[async_trait]
    impl SharedStore for FailingStore {
        async fn incr_window(&self, _: &str, _: Duration) -> Result<u64> {
            Err(crate::Error::store("failing", "down"))
        }
        async fn window_count(&self, _: &str, _: Duration) -> Result<u64> {
            std::future::pending().await
        }
        async fn clear_window(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn publish_circuit(&self, _: &str, _: CircuitState) -> Result<()> {
            Ok(())
        }
        async fn circuit_state(&self, _: &str) -> Result<Option<CircuitState>> {
            Ok(None)
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_window_rolls() {
        let store = MemoryStore::new();
        let w = Duration::from_secs(10);
        assert_eq!(store.incr_window("k", w).await.unwrap(), 1);
        assert_eq!(store.incr_window("k", w).await.unwrap(), 2);
        assert_eq!(store.window_count("k", w).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.window_count("k", w).await.unwrap(), 0);
        store.clear_window("k").await.unwrap();
        assert_eq!(store.window_count("k", w).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_circuits() {
        let store = MemoryStore::new();
        assert_eq!(store.circuit_state("a:1").await.unwrap(), None);
        store.publish_circuit("a:1", CircuitState::Open).await.unwrap();
        assert_eq!(store.circuit_state("a:1").await.unwrap(), Some(CircuitState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_degrades_on_error_and_timeout() {
        let sink = Arc::new(InMemoryEventSink::new(10));
        let handle = StoreHandle::new(
            Arc::new(FailingStore),
            Duration::from_millis(50),
            "test",
            sink.clone(),
        );
        assert_eq!(handle.incr_window("global", Duration::from_secs(1)).await, None);
        assert_eq!(handle.window_count("global", Duration::from_secs(1)).await, None);
        assert_eq!(sink.get_events_by_name("store_degraded").len(), 2);
    }

    #[tokio::test]
    async fn test_handle_prefixes_keys() {
        let store = Arc::new(MemoryStore::new());
        let handle = StoreHandle::new(
            store.clone(),
            Duration::from_millis(50),
            "fleet",
            crate::events::noop_sink(),
        );
        handle.incr_window("user:1", Duration::from_secs(60)).await;
        assert_eq!(
            store
                .window_count("fleet:window:user:1", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
    }
}
