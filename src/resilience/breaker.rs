//! Per-tool circuit breaker.
//!
//! Two states only. Recovery is checked lazily when the next call arrives,
//! never by a background timer: once `recovery_timeout` has passed since the
//! last failure the breaker closes and lets that call through.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::ToolError;
use crate::tool::ToolRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitStatus {
    Closed,
    Open,
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

/// Shared breaker handle. Clones observe and mutate the same state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    tool: Arc<str>,
    config: BreakerConfig,
    state: Arc<Mutex<CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(tool: &str, config: BreakerConfig) -> Self {
        Self {
            tool: tool.into(),
            config,
            state: Arc::new(Mutex::new(CircuitState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        *self.lock()
    }

    /// Admit or reject a call. A rejection leaves the failure count untouched.
    pub fn try_acquire(&self) -> Result<(), ToolError> {
        let mut state = self.lock();
        if state.status == CircuitStatus::Closed {
            return Ok(());
        }
        let since_failure = state
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if since_failure > self.config.recovery_timeout {
            *state = CircuitState::default();
            info!(tool = %self.tool, "circuit closed after recovery timeout");
            return Ok(());
        }
        Err(ToolError::CircuitOpen {
            tool: self.tool.to_string(),
            retry_after: self.config.recovery_timeout - since_failure,
        })
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.status = CircuitStatus::Closed;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        if state.status == CircuitStatus::Closed
            && state.consecutive_failures >= self.config.failure_threshold
        {
            state.status = CircuitStatus::Open;
            warn!(
                tool = %self.tool,
                failures = state.consecutive_failures,
                recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    pub fn reset(&self) {
        *self.lock() = CircuitState::default();
    }
}

#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

#[derive(Clone)]
pub struct Breaker<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = Breaker<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Breaker {
            inner,
            breaker: self.breaker.clone(),
        }
    }
}

impl<S> Service<ToolRequest> for Breaker<S>
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
        let breaker = self.breaker.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Err(rejected) = breaker.try_acquire() {
                return Err(rejected.into());
            }
            match inner.oneshot(req).await {
                Ok(value) => {
                    breaker.record_success();
                    Ok(value)
                }
                Err(e) => {
                    breaker.record_failure();
                    Err(e)
                }
            }
        })
    }
}
