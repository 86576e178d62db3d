//! Observability: tracing spans and per-tool metrics
//!
//! What this module provides
//! - `ObservabilityLayer`, the outermost decorator: one `tool_call` span per
//!   call carrying the tool name and correlation id, plus a metrics update
//! - `MetricsRegistry`, the shared per-tool counters read back through
//!   `ToolPipeline::metrics()`
//!
//! Implementation strategy
//! - The layer instruments the inner future with `tracing::info_span` and
//!   records latency with `tokio::time::Instant` once the call resolves
//! - Failure codes come from the normalized `ToolError` carried by the box
//! - Latency statistics cover a rolling window of the most recent samples

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{info, info_span, warn, Instrument};

use crate::decorator::{Stage, ToolDecorator};
use crate::error::{ErrorCode, ToolError};
use crate::tool::{ToolHandler, ToolRequest};

/// Latency samples kept per tool for the rolling statistics.
pub const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct ToolMetrics {
    calls: u64,
    successes: u64,
    failures: u64,
    failures_by_code: BTreeMap<ErrorCode, u64>,
    cache_hits: u64,
    cache_misses: u64,
    latencies: VecDeque<Duration>,
}

impl ToolMetrics {
    fn push_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn snapshot(&self, tool: &str) -> ToolMetricsSnapshot {
        let ms = |d: &Duration| d.as_micros() as f64 / 1_000.0;
        let (avg, min, max) = if self.latencies.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let total: f64 = self.latencies.iter().map(ms).sum();
            let min = self.latencies.iter().map(ms).fold(f64::INFINITY, f64::min);
            let max = self.latencies.iter().map(ms).fold(0.0, f64::max);
            (total / self.latencies.len() as f64, min, max)
        };
        ToolMetricsSnapshot {
            tool: tool.to_string(),
            calls: self.calls,
            successes: self.successes,
            failures: self.failures,
            failures_by_code: self
                .failures_by_code
                .iter()
                .map(|(code, n)| (code.as_str().to_string(), *n))
                .collect(),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
        }
    }
}

/// Point-in-time view of one tool's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetricsSnapshot {
    pub tool: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub failures_by_code: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
}

/// Shared per-tool metrics store. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<HashMap<String, ToolMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ToolMetrics>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_tool(&self, tool: &str, f: impl FnOnce(&mut ToolMetrics)) {
        let mut map = self.lock();
        f(map.entry(tool.to_string()).or_default());
    }

    pub fn record_success(&self, tool: &str, latency: Duration) {
        self.with_tool(tool, |m| {
            m.calls += 1;
            m.successes += 1;
            m.push_latency(latency);
        });
    }

    pub fn record_failure(&self, tool: &str, code: ErrorCode, latency: Duration) {
        self.with_tool(tool, |m| {
            m.calls += 1;
            m.failures += 1;
            *m.failures_by_code.entry(code).or_default() += 1;
            m.push_latency(latency);
        });
    }

    pub fn record_cache_hit(&self, tool: &str) {
        self.with_tool(tool, |m| m.cache_hits += 1);
    }

    pub fn record_cache_miss(&self, tool: &str) {
        self.with_tool(tool, |m| m.cache_misses += 1);
    }

    pub fn snapshot(&self, tool: &str) -> Option<ToolMetricsSnapshot> {
        self.lock().get(tool).map(|m| m.snapshot(tool))
    }

    /// Snapshots for every tool seen so far, sorted by tool name.
    pub fn snapshot_all(&self) -> Vec<ToolMetricsSnapshot> {
        let map = self.lock();
        let mut out: Vec<_> = map.iter().map(|(tool, m)| m.snapshot(tool)).collect();
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

/// Layer that adds a tracing span and metrics around every call.
#[derive(Clone)]
pub struct ObservabilityLayer {
    metrics: MetricsRegistry,
}

impl ObservabilityLayer {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self { metrics }
    }
}

#[derive(Clone)]
pub struct Observed<S> {
    inner: S,
    metrics: MetricsRegistry,
}

impl<S> Layer<S> for ObservabilityLayer {
    type Service = Observed<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Observed {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> Service<ToolRequest> for Observed<S>
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
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let tool = req.tool.clone();
        let span = info_span!(
            "tool_call",
            tool = %tool,
            correlation_id = %req.context.correlation_id
        );
        let metrics = self.metrics.clone();
        let inner = self.inner.clone();
        Box::pin(
            async move {
                let started = Instant::now();
                match inner.oneshot(req).await {
                    Ok(value) => {
                        let latency = started.elapsed();
                        metrics.record_success(&tool, latency);
                        info!(latency_ms = latency.as_millis() as u64, "tool call succeeded");
                        Ok(value)
                    }
                    Err(err) => {
                        let latency = started.elapsed();
                        let err = ToolError::from_boxed(&tool, err);
                        metrics.record_failure(&tool, err.code(), latency);
                        warn!(
                            code = %err.code(),
                            latency_ms = latency.as_millis() as u64,
                            error = %err,
                            "tool call failed"
                        );
                        Err(err.into())
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Observability stage decorator.
pub struct Observability {
    layer: ObservabilityLayer,
}

impl Observability {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            layer: ObservabilityLayer::new(metrics),
        }
    }
}

impl ToolDecorator for Observability {
    fn stage(&self) -> Stage {
        Stage::Observability
    }

    fn decorate(&self, _tool: &str, inner: ToolHandler) -> ToolHandler {
        BoxCloneService::new(self.layer.layer(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::handler_fn;

    #[tokio::test(start_paused = true)]
    async fn records_successes_failures_and_latency() {
        let metrics = MetricsRegistry::new();
        let svc = ObservabilityLayer::new(metrics.clone()).layer(handler_fn(
            |req: ToolRequest| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if req.params.get("fail").is_some() {
                    Err::<Value, BoxError>(ToolError::not_found("record", "1").into())
                } else {
                    Ok(Value::Bool(true))
                }
            },
        ));

        svc.clone()
            .oneshot(ToolRequest::new("get", serde_json::json!({})))
            .await
            .unwrap();
        let err = svc
            .clone()
            .oneshot(ToolRequest::new("get", serde_json::json!({ "fail": 1 })))
            .await
            .unwrap_err();
        assert!(err.is::<ToolError>());

        let snap = metrics.snapshot("get").unwrap();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.failures_by_code.get("NOT_FOUND"), Some(&1));
        assert_eq!(snap.min_latency_ms, 20.0);
        assert_eq!(snap.max_latency_ms, 20.0);
        assert_eq!(snap.avg_latency_ms, 20.0);
    }

    #[tokio::test]
    async fn foreign_errors_are_normalized_at_the_edge() {
        let metrics = MetricsRegistry::new();
        let svc = ObservabilityLayer::new(metrics.clone()).layer(handler_fn(
            |_req: ToolRequest| async move { Err::<Value, BoxError>("something odd".into()) },
        ));
        let err = svc
            .oneshot(ToolRequest::new("odd", Value::Null))
            .await
            .unwrap_err();
        let err = err.downcast::<ToolError>().unwrap();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(
            metrics.snapshot("odd").unwrap().failures_by_code.get("INTERNAL_ERROR"),
            Some(&1)
        );
    }

    #[test]
    fn rolling_window_drops_oldest_samples() {
        let metrics = MetricsRegistry::new();
        metrics.record_success("t", Duration::from_millis(1_000));
        for _ in 0..LATENCY_WINDOW {
            metrics.record_success("t", Duration::from_millis(10));
        }
        let snap = metrics.snapshot("t").unwrap();
        assert_eq!(snap.calls, LATENCY_WINDOW as u64 + 1);
        assert_eq!(snap.max_latency_ms, 10.0);
        assert_eq!(snap.avg_latency_ms, 10.0);
    }

    #[test]
    fn snapshot_all_is_sorted_and_reset_clears() {
        let metrics = MetricsRegistry::new();
        metrics.record_cache_miss("b");
        metrics.record_cache_hit("a");
        let names: Vec<_> = metrics.snapshot_all().into_iter().map(|s| s.tool).collect();
        assert_eq!(names, vec!["a", "b"]);
        metrics.reset();
        assert!(metrics.snapshot_all().is_empty());
    }
}
