//! # Tower tool pipeline
//!
//! Wrap plain tool handlers in a fixed stack of Tower layers so every call gets
//! the same cross-cutting behavior: metrics and tracing, response caching,
//! parameter validation, circuit breaking, bounded retry and per-attempt
//! timeouts. A decorated handler has exactly the type of a plain one.
//!
//! ## Core Concepts
//!
//! - **ToolHandler**: a boxed `Service<ToolRequest, Response = Value, Error = BoxError>`
//! - **Decorators**: `ToolDecorator`s tagged with a `Stage`; a `DecoratorStack`
//!   composes them outermost first: Observability, Caching, Validation, Resilience
//! - **Pipeline**: `PipelineBuilder` resolves options per tool and composes one
//!   handler per registered tool; `ToolPipeline` routes calls by name
//! - **Commands**: reversible record mutations processed by a FIFO `CommandQueue`
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower_tool_pipeline::{typed_tool, PipelineBuilder, PipelineOptions, ToolError};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct AddArgs {
//!     a: f64,
//!     b: f64,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let add = typed_tool("add", "Add two numbers", |args: AddArgs, _ctx| async move {
//!     Ok::<_, ToolError>(serde_json::json!({ "sum": args.a + args.b }))
//! });
//!
//! let pipeline = PipelineBuilder::new()
//!     .options(PipelineOptions::default().max_retries(2).timeout(Duration::from_secs(5)))
//!     .tool(add)
//!     .require(["add"])
//!     .build()?;
//!
//! let out = pipeline.call("add", serde_json::json!({ "a": 2.0, "b": 3.0 })).await?;
//! assert_eq!(out["sum"], 5.0);
//! println!("{}", serde_json::to_string_pretty(&pipeline.metrics().snapshot_all())?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod commands;
pub mod config;
pub mod decorator;
pub mod env;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod tool;
pub mod validation;

pub use cache::{cache_key, CacheEntry, CacheLayer, CacheStats, ExpiringCache};
pub use commands::{Command, CommandQueue, CommandStatus, InMemoryRecordStore, Record, RecordStore};
pub use config::{Backoff, PipelineConfig, PipelineOptions};
pub use decorator::{DecoratorStack, LayerDecorator, Stage, ToolDecorator};
pub use env::{CapabilityEnv, EnvBuilder};
pub use error::{BuildError, CommandError, ErrorCode, ErrorPayload, Result, ToolError};
pub use observability::{MetricsRegistry, ToolMetricsSnapshot};
pub use pipeline::{PipelineBuilder, ToolPipeline};
pub use resilience::{translate, CircuitBreaker, CircuitState, CircuitStatus};
pub use tool::{
    handler_fn, typed_tool, CallContext, ToolDefinition, ToolDescriptor, ToolHandler, ToolRequest,
};
pub use validation::{validator_fn, SchemaValidator, Validator};

// Re-export Tower traits for convenience
pub use tower::{BoxError, Layer, Service, ServiceExt};
