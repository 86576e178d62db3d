//! Tools as Tower services.
//!
//! A tool handler is a `Service<ToolRequest, Response = Value, Error = BoxError>`.
//! Base handlers and fully decorated chains share the same boxed type,
//! [`ToolHandler`], so a transport cannot tell them apart except by behavior.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::util::BoxCloneService;
use tower::BoxError;
use uuid::Uuid;

use crate::config::PipelineOptions;
use crate::env::CapabilityEnv;
use crate::error::ToolError;

/// Call-scoped context created fresh for every invocation, before any layer runs.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub correlation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub env: CapabilityEnv,
}

impl CallContext {
    pub fn new(env: CapabilityEnv) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            started_at: Utc::now(),
            env,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(CapabilityEnv::empty())
    }
}

/// Request flowing through a tool's decorator chain.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub context: CallContext,
    pub tool: String,
    pub params: Value,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self {
            context: CallContext::default(),
            tool: tool.into(),
            params,
        }
    }

    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }
}

/// Boxed, clonable tool service. Decorators consume one and return another.
pub type ToolHandler = BoxCloneService<ToolRequest, Value, BoxError>;

/// Adapt an async function into a [`ToolHandler`].
///
/// The function may fail with any error convertible into `BoxError`; the
/// resilience layer translates it into a [`ToolError`].
pub fn handler_fn<F, Fut, E>(f: F) -> ToolHandler
where
    F: Fn(ToolRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    BoxCloneService::new(tower::service_fn(move |req: ToolRequest| {
        let fut = f(req);
        async move { fut.await.map_err(Into::into) }
    }))
}

/// Definition of a tool: metadata, parameter schema, base handler, and
/// per-tool option overrides merged over the pipeline options.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    pub handler: ToolHandler,
    pub options: PipelineOptions,
}

impl ToolDefinition {
    /// Tool accepting any JSON object.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: serde_json::json!({ "type": "object" }),
            handler,
            options: PipelineOptions::default(),
        }
    }

    pub fn schema(mut self, parameters_schema: Value) -> Self {
        self.parameters_schema = parameters_schema;
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.parameters_schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("options", &self.options)
            .finish()
    }
}

/// Catalog entry describing a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Build a tool from a typed handler.
/// - `A` is the argument struct; its JSON schema becomes the parameter schema
/// - `R` is the output type (Serialize)
pub fn typed_tool<A, R, H, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: H,
) -> ToolDefinition
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let parameters_schema =
        serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    let handler = Arc::new(handler);
    let service = handler_fn(move |req: ToolRequest| {
        let handler = handler.clone();
        async move {
            let args: A = serde_json::from_value(req.params).map_err(|e| ToolError::Validation {
                message: format!("invalid arguments for '{}'", req.tool),
                details: vec![e.to_string()],
            })?;
            let out = (handler.as_ref())(args, req.context).await?;
            serde_json::to_value(out).map_err(|e| ToolError::internal(e.to_string()))
        }
    });
    ToolDefinition::new(name, description, service).schema(parameters_schema)
}
