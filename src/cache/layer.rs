//! Memoizing layer over an [`ExpiringCache`] of tool results.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

use super::ExpiringCache;
use crate::decorator::{Stage, ToolDecorator};
use crate::observability::MetricsRegistry;
use crate::tool::{ToolHandler, ToolRequest};

/// Deterministic key for a call: `"{tool}:{canonical params}"`.
///
/// Object keys are sorted at every depth, so two parameter objects that differ
/// only in key order share a key. The tool name prefix lets callers invalidate
/// every entry of one tool with `invalidate_prefix("tool:")`.
pub fn cache_key(tool: &str, params: &Value) -> String {
    let mut out = String::with_capacity(tool.len() + 32);
    out.push_str(tool);
    out.push(':');
    write_canonical(params, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Layer caching successful results. Failures are never stored.
#[derive(Clone)]
pub struct CacheLayer {
    cache: ExpiringCache<String, Value>,
    ttl: Duration,
    metrics: Option<MetricsRegistry>,
    live: Option<Arc<AtomicBool>>,
}

impl CacheLayer {
    pub fn new(cache: ExpiringCache<String, Value>) -> Self {
        let ttl = cache.default_ttl();
        Self {
            cache,
            ttl,
            metrics: None,
            live: None,
        }
    }

    /// Store entries with `ttl` instead of the cache's default.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Store results only while `live` is set. Clearing it retires the
    /// handler: calls still in flight complete but leave the cache alone.
    pub fn live_while(mut self, live: Arc<AtomicBool>) -> Self {
        self.live = Some(live);
        self
    }
}

#[derive(Clone)]
pub struct Cached<S> {
    inner: S,
    cache: ExpiringCache<String, Value>,
    ttl: Duration,
    metrics: Option<MetricsRegistry>,
    live: Option<Arc<AtomicBool>>,
}

impl<S> Layer<S> for CacheLayer {
    type Service = Cached<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Cached {
            inner,
            cache: self.cache.clone(),
            ttl: self.ttl,
            metrics: self.metrics.clone(),
            live: self.live.clone(),
        }
    }
}

impl<S> Service<ToolRequest> for Cached<S>
where
    S: Service<ToolRequest, Response = Value, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Readiness of the inner chain is checked only on a miss.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let key = cache_key(&req.tool, &req.params);
        if let Some(hit) = self.cache.get(&key) {
            debug!(tool = %req.tool, correlation_id = %req.context.correlation_id, "cache hit");
            if let Some(m) = &self.metrics {
                m.record_cache_hit(&req.tool);
            }
            return Box::pin(async move { Ok(hit) });
        }
        if let Some(m) = &self.metrics {
            m.record_cache_miss(&req.tool);
        }

        let inner = self.inner.clone();
        let cache = self.cache.clone();
        let ttl = self.ttl;
        let live = self.live.clone();
        Box::pin(async move {
            let tool = req.tool.clone();
            let value = inner.oneshot(req).await?;
            let admit = || live.as_ref().map_or(true, |l| l.load(Ordering::SeqCst));
            if !cache.set_if(key, value.clone(), ttl, admit) {
                debug!(tool = %tool, "handler retired; result not cached");
            }
            Ok(value)
        })
    }
}

/// Caching stage decorator.
pub struct Cache {
    layer: CacheLayer,
}

impl Cache {
    pub fn new(layer: CacheLayer) -> Self {
        Self { layer }
    }
}

impl ToolDecorator for Cache {
    fn stage(&self) -> Stage {
        Stage::Caching
    }

    fn decorate(&self, _tool: &str, inner: ToolHandler) -> ToolHandler {
        BoxCloneService::new(self.layer.layer(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::handler_fn;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(calls: Arc<AtomicUsize>, fail: bool) -> ToolHandler {
        handler_fn(move |req: ToolRequest| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err::<Value, BoxError>("backend down".into())
                } else {
                    Ok(serde_json::json!({ "n": n, "params": req.params }))
                }
            }
        })
    }

    #[test]
    fn key_ignores_object_key_order() {
        let a = serde_json::json!({ "b": 1, "a": { "y": [1, 2], "x": null } });
        let b = serde_json::json!({ "a": { "x": null, "y": [1, 2] }, "b": 1 });
        assert_eq!(cache_key("t", &a), cache_key("t", &b));
        assert_eq!(cache_key("t", &a), r#"t:{"a":{"x":null,"y":[1,2]},"b":1}"#);
        assert_ne!(cache_key("t", &a), cache_key("u", &a));
    }

    #[test]
    fn key_escapes_strings() {
        let v = serde_json::json!({ "q\"": "a\nb" });
        assert_eq!(cache_key("t", &v), r#"t:{"q\"":"a\nb"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ExpiringCache::new(16, Duration::from_secs(5));
        let metrics = MetricsRegistry::default();
        let svc = CacheLayer::new(cache.clone())
            .metrics(metrics.clone())
            .layer(counting_handler(calls.clone(), false));

        let req = ToolRequest::new("get", serde_json::json!({ "id": "x" }));
        let first = svc.clone().oneshot(req.clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(900)).await;
        let second = svc.clone().oneshot(req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = metrics.snapshot("get").unwrap();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_invoke_the_inner_chain_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ExpiringCache::new(16, Duration::from_millis(100));
        let svc = CacheLayer::new(cache).layer(counting_handler(calls.clone(), false));
        let req = ToolRequest::new("get", serde_json::json!({ "id": "x" }));

        svc.clone().oneshot(req.clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(101)).await;
        svc.clone().oneshot(req).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ExpiringCache::new(16, Duration::from_secs(5));
        let svc = CacheLayer::new(cache.clone()).layer(counting_handler(calls.clone(), true));
        let req = ToolRequest::new("get", serde_json::json!({ "id": "x" }));

        assert!(svc.clone().oneshot(req.clone()).await.is_err());
        assert!(svc.clone().oneshot(req).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retired_layers_do_not_store_results() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ExpiringCache::new(16, Duration::from_secs(5));
        let live = Arc::new(AtomicBool::new(true));
        let svc = CacheLayer::new(cache.clone())
            .live_while(live.clone())
            .layer(counting_handler(calls.clone(), false));

        live.store(false, Ordering::SeqCst);
        let req = ToolRequest::new("get", serde_json::json!({ "id": "x" }));
        svc.clone().oneshot(req.clone()).await.unwrap();
        svc.oneshot(req).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn layer_ttl_overrides_cache_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ExpiringCache::new(16, Duration::from_secs(60));
        let svc = CacheLayer::new(cache.clone())
            .ttl(Duration::from_millis(10))
            .layer(counting_handler(calls, false));
        svc.oneshot(ToolRequest::new("get", serde_json::json!({})))
            .await
            .unwrap();
        let entry = cache.peek(&cache_key("get", &serde_json::json!({}))).unwrap();
        assert_eq!(entry.ttl, Duration::from_millis(10));
    }
}
