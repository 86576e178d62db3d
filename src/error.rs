//! Error types for the tool pipeline
//!
//! Every failure that crosses a layer boundary is a boxed [`ToolError`] once it
//! has passed through translation, so outer layers can classify it without
//! knowing the wrapped handler's own error vocabulary.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower::BoxError;

/// Result type alias for pipeline calls
pub type Result<T> = std::result::Result<T, ToolError>;

/// Stable symbolic code attached to every [`ToolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Unauthorized,
    Timeout,
    NetworkError,
    ResourceExhausted,
    InternalError,
    RetryExhausted,
    CircuitOpen,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping surfaced with [`ToolError::RetryExhausted`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryTrace {
    /// Total inner invocations, including the first one.
    pub attempts: u32,
    /// Sum of all backoff delays slept between attempts.
    pub total_delay: Duration,
    /// Delay slept before each retry, in order.
    pub delays: Vec<Duration>,
}

/// Normalized failure produced by the pipeline.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Parameters were rejected; never retried
    #[error("validation failed: {message}")]
    Validation { message: String, details: Vec<String> },

    /// The addressed resource does not exist; never retried
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// Authentication or authorization failure; never retried
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// An attempt did not finish in time
    #[error("tool '{tool}' timed out{}", .after.map(|d| format!(" after {}ms", d.as_millis())).unwrap_or_default())]
    Timeout {
        tool: String,
        after: Option<Duration>,
    },

    /// Transient transport failure
    #[error("network error: {message}")]
    Network { message: String },

    /// Rate limits, quotas, memory pressure
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Anything not otherwise classified
    #[error("internal error: {message}")]
    Internal { message: String },

    /// All attempts failed; carries the last underlying error
    #[error("tool '{tool}' failed after {} attempts ({}ms total delay): {last}", .trace.attempts, .trace.total_delay.as_millis())]
    RetryExhausted {
        tool: String,
        trace: RetryTrace,
        last: Box<ToolError>,
    },

    /// The breaker rejected the call without invoking the handler
    #[error("circuit open for tool '{tool}', retry in {}ms", .retry_after.as_millis())]
    CircuitOpen { tool: String, retry_after: Duration },
}

impl ToolError {
    pub fn validation(message: impl Into<String>) -> Self {
        ToolError::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        ToolError::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        ToolError::Network {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ToolError::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ToolError::Validation { .. } => ErrorCode::ValidationError,
            ToolError::NotFound { .. } => ErrorCode::NotFound,
            ToolError::Authentication { .. } => ErrorCode::Unauthorized,
            ToolError::Timeout { .. } => ErrorCode::Timeout,
            ToolError::Network { .. } => ErrorCode::NetworkError,
            ToolError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            ToolError::Internal { .. } => ErrorCode::InternalError,
            ToolError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            ToolError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
        }
    }

    /// Whether the retry layer may attempt the call again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ToolError::Validation { .. }
                | ToolError::NotFound { .. }
                | ToolError::Authentication { .. }
                | ToolError::RetryExhausted { .. }
                | ToolError::CircuitOpen { .. }
        )
    }

    /// Recover a `ToolError` from a boxed layer error, translating foreign errors.
    pub fn from_boxed(tool: &str, err: BoxError) -> Self {
        crate::resilience::translate(tool, err)
    }

    /// Structured, serializable shape handed to the outermost caller.
    pub fn payload(&self) -> ErrorPayload {
        let details = match self {
            ToolError::Validation { details, .. } if !details.is_empty() => {
                Some(serde_json::json!({ "errors": details }))
            }
            ToolError::RetryExhausted { trace, last, .. } => Some(serde_json::json!({
                "attempts": trace.attempts,
                "totalDelayMs": trace.total_delay.as_millis() as u64,
                "lastError": { "code": last.code(), "message": last.to_string() },
            })),
            ToolError::CircuitOpen { retry_after, .. } => Some(serde_json::json!({
                "retryAfterMs": retry_after.as_millis() as u64,
            })),
            _ => None,
        };
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }
}

/// User-visible failure shape.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Fatal configuration problems detected while assembling the pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("required tools are not registered: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("invalid parameter schema for tool '{tool}': {message}")]
    InvalidSchema { tool: String, message: String },

    #[error("invalid pipeline options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("option '{option}' cannot be overridden per tool ('{tool}')")]
    UnsupportedOverride { tool: String, option: &'static str },
}

/// Misuse of commands or the command queue.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command '{operation}' has already been executed")]
    AlreadyExecuted { operation: &'static str },

    #[error("command '{operation}' has not been executed")]
    NotExecuted { operation: &'static str },

    #[error("command '{operation}' is not reversible")]
    NotReversible { operation: &'static str },

    #[error("command '{operation}' has already been undone")]
    AlreadyUndone { operation: &'static str },

    #[error("no reversible command in history")]
    NothingToUndo,

    #[error("command queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Store(#[from] ToolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolError::Timeout {
            tool: "get_record".into(),
            after: Some(Duration::from_millis(250)),
        };
        assert_eq!(err.to_string(), "tool 'get_record' timed out after 250ms");

        let err = ToolError::not_found("record", "42");
        assert_eq!(err.to_string(), "record not found: 42");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!ToolError::validation("bad").is_retryable());
        assert!(!ToolError::not_found("record", "x").is_retryable());
        assert!(!ToolError::Authentication {
            message: "expired token".into()
        }
        .is_retryable());
        assert!(ToolError::network("reset").is_retryable());
        assert!(ToolError::Timeout {
            tool: "t".into(),
            after: None
        }
        .is_retryable());
        assert!(ToolError::internal("boom").is_retryable());
    }

    #[test]
    fn test_payload_carries_retry_trace() {
        let err = ToolError::RetryExhausted {
            tool: "t".into(),
            trace: RetryTrace {
                attempts: 3,
                total_delay: Duration::from_millis(300),
                delays: vec![Duration::from_millis(100), Duration::from_millis(200)],
            },
            last: Box::new(ToolError::network("down")),
        };
        let payload = serde_json::to_value(err.payload()).unwrap();
        assert_eq!(payload["code"], "RETRY_EXHAUSTED");
        assert_eq!(payload["details"]["attempts"], 3);
        assert_eq!(payload["details"]["totalDelayMs"], 300);
        assert_eq!(payload["details"]["lastError"]["code"], "NETWORK_ERROR");
    }

    #[test]
    fn test_build_error_lists_missing_tools() {
        let err = BuildError::MissingTools(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "required tools are not registered: a, b");
    }
}
