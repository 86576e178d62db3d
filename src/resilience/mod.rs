//! Resilience stage: circuit breaker, retry, per-attempt timeout, error translation
//!
//! What this module provides
//! - `CircuitBreakerLayer` over a shared per-tool `CircuitBreaker`
//! - `RetryLayer` with linear or exponential backoff and an aggregated
//!   `RetryExhausted` failure
//! - `TimeoutLayer` that abandons slow attempts without cancelling them
//! - `TranslateLayer` and `translate`, mapping foreign errors onto `ToolError`
//! - `Resilience`, the stage decorator assembling the above for one tool
//!
//! Implementation strategy
//! - Wrapping order, outward to inward: breaker, retry, timeout, translate, base.
//!   The breaker therefore counts one failure per logical call, and every
//!   attempt gets its own deadline
//! - Retry state lives in the call future; breaker state is the only shared
//!   mutable state and sits behind a mutex
//!
//! Testing strategy
//! - Scripted handlers failing a fixed number of times under a paused clock,
//!   asserting invocation counts and exact backoff delays
//! - Breaker transitions driven by `tokio::time::advance`

mod breaker;
mod retry;
mod timeout;
mod translate;

pub use breaker::{Breaker, CircuitBreaker, CircuitBreakerLayer, CircuitState, CircuitStatus};
pub use retry::{Retry, RetryLayer};
pub use timeout::{Timeout, TimeoutLayer};
pub use translate::{translate, Translate, TranslateLayer};

use tower::util::BoxCloneService;
use tower::Layer;

use crate::config::{RetryConfig, TimeoutConfig};
use crate::decorator::{Stage, ToolDecorator};
use crate::tool::ToolHandler;

/// Resilience stage decorator for one tool.
pub struct Resilience {
    retry: RetryConfig,
    timeout: TimeoutConfig,
    breaker: Option<CircuitBreaker>,
}

impl Resilience {
    pub fn new(retry: RetryConfig, timeout: TimeoutConfig) -> Self {
        Self {
            retry,
            timeout,
            breaker: None,
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

impl ToolDecorator for Resilience {
    fn stage(&self) -> Stage {
        Stage::Resilience
    }

    fn decorate(&self, tool: &str, inner: ToolHandler) -> ToolHandler {
        let translated = TranslateLayer::new(tool).layer(inner);
        let timed = TimeoutLayer::new(tool, self.timeout.timeout).layer(translated);
        let retried: ToolHandler = if self.retry.enabled {
            BoxCloneService::new(RetryLayer::new(tool, self.retry).layer(timed))
        } else {
            BoxCloneService::new(timed)
        };
        match &self.breaker {
            Some(breaker) => {
                BoxCloneService::new(CircuitBreakerLayer::new(breaker.clone()).layer(retried))
            }
            None => retried,
        }
    }
}
