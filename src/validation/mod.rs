//! Parameter validation stage
//!
//! What this module provides
//! - `Validator`, the seam through which parameters are checked and possibly
//!   normalized before reaching the resilience stage
//! - `SchemaValidator`, backed by `jsonschema`, compiled once per tool at build time
//! - `validator_fn` for ad-hoc closures, and `ValidationLayer` / `Validation`
//!
//! Implementation strategy
//! - The layer replaces `req.params` with the validator's output; a rejection
//!   short-circuits with `ToolError::Validation` and the inner chain never runs
//! - Every schema violation is reported with its instance path

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

use crate::decorator::{Stage, ToolDecorator};
use crate::error::{BuildError, ToolError};
use crate::tool::{ToolHandler, ToolRequest};

/// Checks raw parameters, returning the params to forward.
pub trait Validator: Send + Sync {
    fn validate(&self, tool: &str, params: Value) -> Result<Value, ToolError>;
}

/// JSON Schema validator compiled from a tool's parameter schema.
pub struct SchemaValidator {
    schema: jsonschema::Validator,
}

impl SchemaValidator {
    pub fn new(tool: &str, schema: &Value) -> Result<Self, BuildError> {
        let schema = jsonschema::validator_for(schema).map_err(|e| BuildError::InvalidSchema {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { schema })
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, tool: &str, params: Value) -> Result<Value, ToolError> {
        let details: Vec<String> = self
            .schema
            .iter_errors(&params)
            .map(|e| {
                let path = e.instance_path().to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        if details.is_empty() {
            Ok(params)
        } else {
            Err(ToolError::Validation {
                message: format!("invalid parameters for '{tool}'"),
                details,
            })
        }
    }
}

struct FnValidator<F>(F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&str, Value) -> Result<Value, ToolError> + Send + Sync,
{
    fn validate(&self, tool: &str, params: Value) -> Result<Value, ToolError> {
        (self.0)(tool, params)
    }
}

/// Wrap a closure as a [`Validator`].
pub fn validator_fn<F>(f: F) -> Arc<dyn Validator>
where
    F: Fn(&str, Value) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    Arc::new(FnValidator(f))
}

#[derive(Clone)]
pub struct ValidationLayer {
    validator: Arc<dyn Validator>,
}

impl ValidationLayer {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }
}

#[derive(Clone)]
pub struct Validated<S> {
    inner: S,
    validator: Arc<dyn Validator>,
}

impl<S> Layer<S> for ValidationLayer {
    type Service = Validated<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Validated {
            inner,
            validator: self.validator.clone(),
        }
    }
}

impl<S> Service<ToolRequest> for Validated<S>
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

    fn call(&mut self, mut req: ToolRequest) -> Self::Future {
        let params = std::mem::take(&mut req.params);
        match self.validator.validate(&req.tool, params) {
            Ok(params) => {
                req.params = params;
                Box::pin(self.inner.clone().oneshot(req))
            }
            Err(err) => {
                debug!(
                    tool = %req.tool,
                    correlation_id = %req.context.correlation_id,
                    error = %err,
                    "parameters rejected"
                );
                Box::pin(async move { Err(err.into()) })
            }
        }
    }
}

/// Validation stage decorator.
pub struct Validation {
    layer: ValidationLayer,
}

impl Validation {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self {
            layer: ValidationLayer::new(validator),
        }
    }

    /// Schema-backed validation for one tool.
    pub fn from_schema(tool: &str, schema: &Value) -> Result<Self, BuildError> {
        Ok(Self::new(Arc::new(SchemaValidator::new(tool, schema)?)))
    }
}

impl ToolDecorator for Validation {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn decorate(&self, _tool: &str, inner: ToolHandler) -> ToolHandler {
        BoxCloneService::new(self.layer.layer(inner))
    }
}
