//! Configuration for the pipeline decorators
//!
//! [`PipelineOptions`] is the recognized option surface (all fields optional,
//! camelCase on the wire). It resolves into one immutable config per decorator
//! kind via [`PipelineConfig::from_options`]; unset options fall back to the
//! defaults below. Merging is shallow and last-write-wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CACHE_TTL_MS: u64 = 300_000;
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1_000;

/// Tool catalog entries live much longer than call results.
pub const CATALOG_TTL: Duration = Duration::from_secs(3_600);

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
}

impl Backoff {
    /// Delay slept before attempt `attempt` (the first retry is attempt 2).
    ///
    /// Linear: `base * attempt`. Exponential: `base * 2^(attempt - 2)`.
    pub fn delay_before(&self, base: Duration, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        match self {
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Caller-facing options. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_retry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<Backoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_circuit_breaker: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_caching: Option<bool>,
    #[serde(rename = "cacheTTLMs", skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_max_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_validation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_metrics: Option<bool>,
}

impl PipelineOptions {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Shallow merge: every option set in `overrides` replaces the one in `self`.
    pub fn merge(&self, overrides: &PipelineOptions) -> PipelineOptions {
        PipelineOptions {
            enable_retry: overrides.enable_retry.or(self.enable_retry),
            max_retries: overrides.max_retries.or(self.max_retries),
            retry_delay_ms: overrides.retry_delay_ms.or(self.retry_delay_ms),
            retry_backoff: overrides.retry_backoff.or(self.retry_backoff),
            timeout_ms: overrides.timeout_ms.or(self.timeout_ms),
            enable_circuit_breaker: overrides
                .enable_circuit_breaker
                .or(self.enable_circuit_breaker),
            failure_threshold: overrides.failure_threshold.or(self.failure_threshold),
            recovery_timeout_ms: overrides.recovery_timeout_ms.or(self.recovery_timeout_ms),
            enable_caching: overrides.enable_caching.or(self.enable_caching),
            cache_ttl_ms: overrides.cache_ttl_ms.or(self.cache_ttl_ms),
            cache_max_size: overrides.cache_max_size.or(self.cache_max_size),
            enable_validation: overrides.enable_validation.or(self.enable_validation),
            enable_metrics: overrides.enable_metrics.or(self.enable_metrics),
        }
    }

    // Builder-style setters used by tests and tool definitions.

    pub fn retry(mut self, enabled: bool) -> Self {
        self.enable_retry = Some(enabled);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.enable_circuit_breaker = Some(enabled);
        self
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = Some(n);
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn caching(mut self, enabled: bool) -> Self {
        self.enable_caching = Some(enabled);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn cache_max_size(mut self, n: usize) -> Self {
        self.cache_max_size = Some(n);
        self
    }

    pub fn validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    pub fn metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = Some(enabled);
        self
    }
}

/// Retry tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Add up to 30% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            backoff: Backoff::Exponential,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff.delay_before(self.base_delay, attempt)
    }
}

/// Per-attempt timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Circuit breaker tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_millis(DEFAULT_RECOVERY_TIMEOUT_MS),
        }
    }
}

/// Response cache tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

/// Resolved per-tool configuration, one struct per decorator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub validation: bool,
    pub metrics: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_options(&PipelineOptions::default())
    }
}

impl PipelineConfig {
    pub fn from_options(options: &PipelineOptions) -> Self {
        let retry_defaults = RetryConfig::default();
        let breaker_defaults = BreakerConfig::default();
        let cache_defaults = CacheConfig::default();
        Self {
            retry: RetryConfig {
                enabled: options.enable_retry.unwrap_or(retry_defaults.enabled),
                max_retries: options.max_retries.unwrap_or(retry_defaults.max_retries),
                base_delay: options
                    .retry_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.base_delay),
                backoff: options.retry_backoff.unwrap_or(retry_defaults.backoff),
                jitter: retry_defaults.jitter,
            },
            timeout: TimeoutConfig {
                timeout: options
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| TimeoutConfig::default().timeout),
            },
            breaker: BreakerConfig {
                enabled: options
                    .enable_circuit_breaker
                    .unwrap_or(breaker_defaults.enabled),
                failure_threshold: options
                    .failure_threshold
                    .unwrap_or(breaker_defaults.failure_threshold),
                recovery_timeout: options
                    .recovery_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(breaker_defaults.recovery_timeout),
            },
            cache: CacheConfig {
                enabled: options.enable_caching.unwrap_or(cache_defaults.enabled),
                ttl: options
                    .cache_ttl_ms
                    .map(Duration::from_millis)
                    .unwrap_or(cache_defaults.ttl),
                max_size: options.cache_max_size.unwrap_or(cache_defaults.max_size),
            },
            validation: options.enable_validation.unwrap_or(true),
            metrics: options.enable_metrics.unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert!(cfg.retry.enabled);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.backoff, Backoff::Exponential);
        assert_eq!(cfg.timeout.timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.recovery_timeout, Duration::from_secs(60));
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let base = Duration::from_millis(100);
        let b = Backoff::Exponential;
        assert_eq!(b.delay_before(base, 2), Duration::from_millis(100));
        assert_eq!(b.delay_before(base, 3), Duration::from_millis(200));
        assert_eq!(b.delay_before(base, 4), Duration::from_millis(400));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let base = Duration::from_millis(100);
        let b = Backoff::Linear;
        assert_eq!(b.delay_before(base, 2), Duration::from_millis(200));
        assert_eq!(b.delay_before(base, 3), Duration::from_millis(300));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let d = Backoff::Exponential.delay_before(Duration::from_secs(1), 200);
        assert!(d >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn parses_recognized_option_names() {
        let opts = PipelineOptions::from_json_str(
            r#"{"enableRetry":true,"maxRetries":2,"retryDelayMs":100,"retryBackoff":"linear",
                "timeoutMs":500,"enableCircuitBreaker":false,"failureThreshold":3,
                "recoveryTimeoutMs":1000,"enableCaching":true,"cacheTTLMs":5000,
                "cacheMaxSize":10}"#,
        )
        .unwrap();
        let cfg = PipelineConfig::from_options(&opts);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.backoff, Backoff::Linear);
        assert_eq!(cfg.timeout.timeout, Duration::from_millis(500));
        assert!(!cfg.breaker.enabled);
        assert_eq!(cfg.cache.ttl, Duration::from_millis(5000));
        assert_eq!(cfg.cache.max_size, 10);
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(PipelineOptions::from_json_str(r#"{"retries": 3}"#).is_err());
    }

    #[test]
    fn merge_is_shallow_last_write_wins() {
        let base = PipelineOptions::default().max_retries(5).timeout(Duration::from_secs(1));
        let over = PipelineOptions::default().max_retries(1);
        let merged = base.merge(&over);
        assert_eq!(merged.max_retries, Some(1));
        assert_eq!(merged.timeout_ms, Some(1000));
        assert_eq!(merged.enable_caching, None);
    }
}
