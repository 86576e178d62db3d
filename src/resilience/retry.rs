//! Bounded retry with linear or exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, warn};

use super::translate;
use crate::config::RetryConfig;
use crate::error::{RetryTrace, ToolError};
use crate::tool::ToolRequest;

/// Bookkeeping local to one logical call.
#[derive(Debug, Default)]
struct RetryContext {
    attempt: u32,
    delays: Vec<Duration>,
}

impl RetryContext {
    fn trace(self) -> RetryTrace {
        RetryTrace {
            attempts: self.attempt,
            total_delay: self.delays.iter().sum(),
            delays: self.delays,
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let jitter = rand::thread_rng().gen_range(0.0..0.3);
    delay + delay.mul_f64(jitter)
}

#[derive(Clone)]
pub struct RetryLayer {
    tool: Arc<str>,
    config: RetryConfig,
}

impl RetryLayer {
    pub fn new(tool: &str, config: RetryConfig) -> Self {
        Self {
            tool: tool.into(),
            config,
        }
    }
}

#[derive(Clone)]
pub struct Retry<S> {
    inner: S,
    tool: Arc<str>,
    config: RetryConfig,
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            tool: self.tool.clone(),
            config: self.config,
        }
    }
}

impl<S> Service<ToolRequest> for Retry<S>
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
        let config = self.config;
        Box::pin(async move {
            let correlation_id = req.context.correlation_id;
            let mut ctx = RetryContext::default();
            loop {
                ctx.attempt += 1;
                let err = match inner.clone().oneshot(req.clone()).await {
                    Ok(value) => {
                        if ctx.attempt > 1 {
                            debug!(tool = %tool, attempt = ctx.attempt, "succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(e) => translate(&tool, e),
                };
                if !err.is_retryable() {
                    return Err(err.into());
                }
                if ctx.attempt > config.max_retries {
                    warn!(
                        tool = %tool,
                        correlation_id = %correlation_id,
                        attempts = ctx.attempt,
                        code = %err.code(),
                        "retries exhausted"
                    );
                    return Err(ToolError::RetryExhausted {
                        tool: tool.to_string(),
                        trace: ctx.trace(),
                        last: Box::new(err),
                    }
                    .into());
                }
                let mut delay = config.delay_before(ctx.attempt + 1);
                if config.jitter {
                    delay = with_jitter(delay);
                }
                warn!(
                    tool = %tool,
                    correlation_id = %correlation_id,
                    attempt = ctx.attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = %err.code(),
                    error = %err,
                    "attempt failed; retrying"
                );
                ctx.delays.push(delay);
                sleep(delay).await;
            }
        })
    }
}
