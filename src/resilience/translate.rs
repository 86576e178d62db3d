//! Translation of foreign handler errors into [`ToolError`].

use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tower::{BoxError, Layer, Service};

use crate::error::ToolError;
use crate::tool::ToolRequest;

const NETWORK_MARKERS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "connection refused",
    "connection reset",
    "network",
    "socket hang up",
];
const EXHAUSTION_MARKERS: &[&str] = &["rate limit", "too many requests", "quota", "out of memory"];
const TIMEOUT_MARKERS: &[&str] = &["etimedout", "timed out", "timeout"];
const AUTH_MARKERS: &[&str] = &["unauthorized", "forbidden", "invalid token", "unauthenticated"];
const NOT_FOUND_MARKERS: &[&str] = &["not found", "does not exist", "no such"];
const VALIDATION_MARKERS: &[&str] = &[
    "bad request",
    "invalid argument",
    "invalid input",
    "invalid parameter",
    "malformed",
];

/// Normalize any boxed error into a [`ToolError`]. Already-normalized errors
/// pass through untouched.
pub fn translate(tool: &str, err: BoxError) -> ToolError {
    let err = match err.downcast::<ToolError>() {
        Ok(e) => return *e,
        Err(err) => err,
    };
    if err.is::<tower::timeout::error::Elapsed>() || err.is::<tokio::time::error::Elapsed>() {
        return ToolError::Timeout {
            tool: tool.to_string(),
            after: None,
        };
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return from_io(tool, io);
    }
    if let Some(json) = err.downcast_ref::<serde_json::Error>() {
        return ToolError::Validation {
            message: format!("malformed payload for '{tool}'"),
            details: vec![json.to_string()],
        };
    }
    from_message(tool, err.to_string())
}

fn from_io(tool: &str, io: &std::io::Error) -> ToolError {
    let message = io.to_string();
    match io.kind() {
        ErrorKind::TimedOut => ToolError::Timeout {
            tool: tool.to_string(),
            after: None,
        },
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => ToolError::Network { message },
        ErrorKind::OutOfMemory => ToolError::ResourceExhausted { message },
        ErrorKind::PermissionDenied => ToolError::Authentication { message },
        ErrorKind::NotFound => ToolError::NotFound {
            resource: "resource".to_string(),
            id: message,
        },
        ErrorKind::InvalidInput | ErrorKind::InvalidData => ToolError::Validation {
            message,
            details: Vec::new(),
        },
        _ => ToolError::Internal { message },
    }
}

fn from_message(tool: &str, message: String) -> ToolError {
    let lowered = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));
    if has(TIMEOUT_MARKERS) {
        ToolError::Timeout {
            tool: tool.to_string(),
            after: None,
        }
    } else if has(NETWORK_MARKERS) {
        ToolError::Network { message }
    } else if has(EXHAUSTION_MARKERS) {
        ToolError::ResourceExhausted { message }
    } else if has(AUTH_MARKERS) {
        ToolError::Authentication { message }
    } else if has(NOT_FOUND_MARKERS) {
        ToolError::NotFound {
            resource: "resource".to_string(),
            id: message,
        }
    } else if has(VALIDATION_MARKERS) {
        ToolError::Validation {
            message,
            details: Vec::new(),
        }
    } else {
        ToolError::Internal { message }
    }
}

/// Innermost layer: every error leaving the base handler becomes a boxed `ToolError`.
#[derive(Clone)]
pub struct TranslateLayer {
    tool: Arc<str>,
}

impl TranslateLayer {
    pub fn new(tool: &str) -> Self {
        Self { tool: tool.into() }
    }
}

#[derive(Clone)]
pub struct Translate<S> {
    inner: S,
    tool: Arc<str>,
}

impl<S> Layer<S> for TranslateLayer {
    type Service = Translate<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Translate {
            inner,
            tool: self.tool.clone(),
        }
    }
}

impl<S> Service<ToolRequest> for Translate<S>
where
    S: Service<ToolRequest, Response = Value, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|e| translate(&self.tool, e).into())
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let tool = self.tool.clone();
        let fut = self.inner.call(req);
        Box::pin(async move { fut.await.map_err(|e| translate(&tool, e).into()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn code_of(err: BoxError) -> ErrorCode {
        translate("t", err).code()
    }

    #[test]
    fn tool_errors_pass_through() {
        let original = ToolError::not_found("record", "7");
        let back = translate("t", Box::new(original));
        assert!(matches!(back, ToolError::NotFound { ref id, .. } if id == "7"));
    }

    #[test]
    fn io_errors_map_by_kind() {
        let io = |k| -> BoxError { Box::new(std::io::Error::new(k, "x")) };
        assert_eq!(code_of(io(ErrorKind::TimedOut)), ErrorCode::Timeout);
        assert_eq!(code_of(io(ErrorKind::ConnectionReset)), ErrorCode::NetworkError);
        assert_eq!(code_of(io(ErrorKind::OutOfMemory)), ErrorCode::ResourceExhausted);
        assert_eq!(code_of(io(ErrorKind::PermissionDenied)), ErrorCode::Unauthorized);
        assert_eq!(code_of(io(ErrorKind::Other)), ErrorCode::InternalError);
    }

    #[test]
    fn messages_map_by_marker() {
        assert_eq!(code_of("connect ECONNREFUSED 127.0.0.1".into()), ErrorCode::NetworkError);
        assert_eq!(code_of("429 Too Many Requests".into()), ErrorCode::ResourceExhausted);
        assert_eq!(code_of("request timed out".into()), ErrorCode::Timeout);
        assert_eq!(code_of("401 Unauthorized".into()), ErrorCode::Unauthorized);
        assert_eq!(code_of("kaboom".into()), ErrorCode::InternalError);
    }

    #[test]
    fn untyped_client_errors_are_not_retryable() {
        let not_found = translate("t", "404 Not Found".into());
        assert_eq!(not_found.code(), ErrorCode::NotFound);
        assert!(!not_found.is_retryable());

        let invalid = translate("t", "400 Bad Request: invalid parameter 'id'".into());
        assert_eq!(invalid.code(), ErrorCode::ValidationError);
        assert!(!invalid.is_retryable());

        // DNS failures stay network errors.
        let dns = translate("t", "getaddrinfo ENOTFOUND api.local".into());
        assert_eq!(dns.code(), ErrorCode::NetworkError);
    }

    #[test]
    fn json_errors_are_validation_failures() {
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        assert_eq!(code_of(Box::new(err)), ErrorCode::ValidationError);
    }
}
