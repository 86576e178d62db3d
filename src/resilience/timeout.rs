//! Per-attempt timeout with cooperative abandonment.
//!
//! The inner call runs on its own task. When the deadline passes the caller
//! gets [`ToolError::Timeout`] and the task handle is dropped: the callee keeps
//! running to completion and its late result is discarded with the task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::warn;

use crate::error::ToolError;
use crate::tool::ToolRequest;

#[derive(Clone)]
pub struct TimeoutLayer {
    tool: Arc<str>,
    duration: Duration,
}

impl TimeoutLayer {
    pub fn new(tool: &str, duration: Duration) -> Self {
        Self {
            tool: tool.into(),
            duration,
        }
    }
}

#[derive(Clone)]
pub struct Timeout<S> {
    inner: S,
    tool: Arc<str>,
    duration: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            tool: self.tool.clone(),
            duration: self.duration,
        }
    }
}

impl<S> Service<ToolRequest> for Timeout<S>
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
        let inner = self.inner.clone();
        let tool = self.tool.clone();
        let duration = self.duration;
        Box::pin(async move {
            let correlation_id = req.context.correlation_id;
            let task = tokio::spawn(inner.oneshot(req));
            match tokio::time::timeout(duration, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => {
                    Err(ToolError::internal(format!("handler task failed: {join}")).into())
                }
                Err(_elapsed) => {
                    warn!(
                        tool = %tool,
                        correlation_id = %correlation_id,
                        timeout_ms = duration.as_millis() as u64,
                        "attempt timed out; abandoning in-flight call"
                    );
                    Err(ToolError::Timeout {
                        tool: tool.to_string(),
                        after: Some(duration),
                    }
                    .into())
                }
            }
        })
    }
}
