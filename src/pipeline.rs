//! Pipeline assembly: one composed handler per registered tool
//!
//! What this module provides
//! - `PipelineBuilder`: collect tool definitions, global options, shared
//!   capabilities and required names, then `build()`
//! - `ToolPipeline`: routes calls by tool name, injects a fresh `CallContext`
//!   per call, and exposes metrics, cache and breaker introspection
//!
//! Implementation strategy
//! - Per tool, global options are shallow-merged with the tool's overrides and
//!   resolved into a `PipelineConfig`; enabled concerns become decorators in a
//!   `DecoratorStack`, composed once at registration time
//! - One call-results cache is shared by every tool (capacity from the global
//!   options, TTL per tool); a second cache instance holds the tool catalog
//! - `ToolPipeline` is also a Tower service over `ToolRequest`, dispatching by
//!   name like a router
//!
//! Testing strategy
//! - Build pipelines with scripted handlers and assert end-to-end behavior:
//!   stage ordering, overwrite-on-register, missing required tools, catalog caching

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheLayer, CacheStats, ExpiringCache};
use crate::config::{PipelineConfig, PipelineOptions, CATALOG_TTL};
use crate::decorator::{DecoratorStack, ToolDecorator};
use crate::env::CapabilityEnv;
use crate::error::{BuildError, ToolError};
use crate::observability::{MetricsRegistry, Observability, ToolMetricsSnapshot};
use crate::resilience::{CircuitBreaker, CircuitState, Resilience};
use crate::tool::{CallContext, ToolDefinition, ToolDescriptor, ToolHandler, ToolRequest};
use crate::validation::{SchemaValidator, Validation, Validator};

const CATALOG_KEY: &str = "catalog";

/// Collects everything needed to assemble a [`ToolPipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    options: PipelineOptions,
    env: CapabilityEnv,
    tools: Vec<ToolDefinition>,
    validators: HashMap<String, Arc<dyn Validator>>,
    required: BTreeSet<String>,
    decorators: Vec<Arc<dyn ToolDecorator>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global options applied to every tool before its own overrides.
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Shared collaborators handed to every call through its `CallContext`.
    pub fn env(mut self, env: CapabilityEnv) -> Self {
        self.env = env;
        self
    }

    /// Register a tool. A later registration under the same name wins.
    pub fn tool(mut self, definition: ToolDefinition) -> Self {
        if let Some(pos) = self.tools.iter().position(|t| t.name == definition.name) {
            warn!(tool = %definition.name, "tool re-registered; previous definition replaced");
            self.tools.remove(pos);
        }
        self.tools.push(definition);
        self
    }

    /// Use `validator` instead of the tool's parameter schema.
    pub fn validator(mut self, tool: impl Into<String>, validator: Arc<dyn Validator>) -> Self {
        self.validators.insert(tool.into(), validator);
        self
    }

    /// Names that must be registered for `build()` to succeed.
    pub fn require<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    /// Extra decorator applied to every tool at its declared stage.
    pub fn decorator(mut self, decorator: impl ToolDecorator + 'static) -> Self {
        self.decorators.push(Arc::new(decorator));
        self
    }

    pub fn build(self) -> Result<ToolPipeline, BuildError> {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| !self.tools.iter().any(|t| &t.name == *name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingTools(missing));
        }

        let global = PipelineConfig::from_options(&self.options);
        let shared = Shared {
            options: self.options,
            env: self.env,
            metrics: MetricsRegistry::new(),
            cache: ExpiringCache::new(global.cache.max_size, global.cache.ttl),
            catalog: ExpiringCache::new(1, CATALOG_TTL),
            validators: self.validators,
            decorators: self.decorators,
        };

        let mut tools = HashMap::with_capacity(self.tools.len());
        for definition in self.tools {
            let registered = shared.compile(definition)?;
            tools.insert(registered.definition.name.clone(), registered);
        }
        info!(tools = tools.len(), "tool pipeline assembled");

        Ok(ToolPipeline {
            inner: Arc::new(Inner {
                shared,
                tools: Mutex::new(tools),
            }),
        })
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
    breaker: Option<CircuitBreaker>,
    // Cleared when the definition is replaced.
    live: Arc<AtomicBool>,
}

impl RegisteredTool {
    fn retire(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    options: PipelineOptions,
    env: CapabilityEnv,
    metrics: MetricsRegistry,
    cache: ExpiringCache<String, Value>,
    catalog: ExpiringCache<&'static str, Arc<Vec<ToolDescriptor>>>,
    validators: HashMap<String, Arc<dyn Validator>>,
    decorators: Vec<Arc<dyn ToolDecorator>>,
}

impl Shared {
    fn compile(&self, definition: ToolDefinition) -> Result<RegisteredTool, BuildError> {
        let name = definition.name.clone();
        // Capacity belongs to the shared results cache, not to one tool.
        if definition.options.cache_max_size.is_some() {
            return Err(BuildError::UnsupportedOverride {
                tool: name,
                option: "cacheMaxSize",
            });
        }
        let config = PipelineConfig::from_options(&self.options.merge(&definition.options));
        let live = Arc::new(AtomicBool::new(true));

        let mut stack = DecoratorStack::new();
        if config.metrics {
            stack = stack.push(Observability::new(self.metrics.clone()));
        }
        if config.cache.enabled {
            let mut layer = CacheLayer::new(self.cache.clone())
                .ttl(config.cache.ttl)
                .live_while(live.clone());
            if config.metrics {
                layer = layer.metrics(self.metrics.clone());
            }
            stack = stack.push(Cache::new(layer));
        }
        if config.validation {
            let validator: Arc<dyn Validator> = match self.validators.get(&name) {
                Some(v) => v.clone(),
                None => Arc::new(SchemaValidator::new(&name, &definition.parameters_schema)?),
            };
            stack = stack.push(Validation::new(validator));
        }
        let breaker = config
            .breaker
            .enabled
            .then(|| CircuitBreaker::new(&name, config.breaker));
        let mut resilience = Resilience::new(config.retry, config.timeout);
        if let Some(b) = &breaker {
            resilience = resilience.with_breaker(b.clone());
        }
        stack = stack.push(resilience);
        for d in &self.decorators {
            stack = stack.push_shared(d.clone());
        }

        debug!(tool = %name, stages = ?stack.stages(), "composed tool handler");
        let handler = stack.compose(&name, definition.handler.clone());
        Ok(RegisteredTool {
            definition,
            handler,
            breaker,
            live,
        })
    }
}

struct Inner {
    shared: Shared,
    // Handlers are `Send` but not `Sync`.
    tools: Mutex<HashMap<String, RegisteredTool>>,
}

/// Assembled tool pipeline. Clones share registrations, caches and metrics.
#[derive(Clone)]
pub struct ToolPipeline {
    inner: Arc<Inner>,
}

impl ToolPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    fn tools(&self) -> MutexGuard<'_, HashMap<String, RegisteredTool>> {
        self.inner.tools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh call-scoped context over the pipeline's shared capabilities.
    pub fn context(&self) -> CallContext {
        CallContext::new(self.inner.shared.env.clone())
    }

    /// Invoke `tool` with `params` under a fresh context.
    pub async fn call(&self, tool: &str, params: Value) -> Result<Value, ToolError> {
        self.call_with_context(tool, params, self.context()).await
    }

    pub async fn call_with_context(
        &self,
        tool: &str,
        params: Value,
        context: CallContext,
    ) -> Result<Value, ToolError> {
        let handler = self
            .handler(tool)
            .ok_or_else(|| ToolError::not_found("tool", tool))?;
        let req = ToolRequest::new(tool, params).with_context(context);
        handler
            .oneshot(req)
            .await
            .map_err(|e| ToolError::from_boxed(tool, e))
    }

    /// The composed handler for `tool`.
    pub fn handler(&self, tool: &str) -> Option<ToolHandler> {
        self.tools().get(tool).map(|t| t.handler.clone())
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.tools().contains_key(tool)
    }

    /// Registered names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools().keys().cloned().collect();
        names.sort();
        names
    }

    /// Catalog of registered tools, sorted by name, served from the catalog cache.
    pub fn list_tools(&self) -> Arc<Vec<ToolDescriptor>> {
        let catalog = &self.inner.shared.catalog;
        if let Some(hit) = catalog.get(&CATALOG_KEY) {
            return hit;
        }
        // Stored under the registry lock so `register` clears it after, never before.
        let tools = self.tools();
        let mut descriptors: Vec<ToolDescriptor> =
            tools.values().map(|t| t.definition.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        let descriptors = Arc::new(descriptors);
        catalog.set(CATALOG_KEY, descriptors.clone());
        descriptors
    }

    /// Register or replace a tool on a live pipeline.
    ///
    /// Replacing a tool drops its cached results and resets its breaker.
    /// Calls already running on the replaced handler finish, but their
    /// results are not cached.
    pub fn register(&self, definition: ToolDefinition) -> Result<(), BuildError> {
        let registered = self.inner.shared.compile(definition)?;
        let name = registered.definition.name.clone();
        let replaced = {
            let mut tools = self.tools();
            let replaced = tools.insert(name.clone(), registered);
            self.inner.shared.catalog.clear();
            replaced
        };
        match replaced {
            Some(old) => {
                old.retire();
                self.invalidate_tool(&name);
                warn!(tool = %name, "tool re-registered; previous definition replaced");
            }
            None => info!(tool = %name, "tool registered"),
        }
        Ok(())
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.shared.metrics
    }

    pub fn tool_metrics(&self, tool: &str) -> Option<ToolMetricsSnapshot> {
        self.inner.shared.metrics.snapshot(tool)
    }

    /// The shared call-results cache.
    pub fn cache(&self) -> &ExpiringCache<String, Value> {
        &self.inner.shared.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.shared.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.shared.cache.clear();
    }

    /// Drop cached results for one tool.
    pub fn invalidate_tool(&self, tool: &str) -> usize {
        self.inner.shared.cache.invalidate_prefix(&format!("{tool}:"))
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.inner.shared.cache.invalidate_prefix(prefix)
    }

    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize, regex::Error> {
        self.inner.shared.cache.invalidate_pattern(pattern)
    }

    pub fn cache_size(&self) -> usize {
        self.inner.shared.cache.size()
    }

    /// Breaker state of `tool`, if it has one.
    pub fn circuit(&self, tool: &str) -> Option<CircuitState> {
        self.tools()
            .get(tool)
            .and_then(|t| t.breaker.as_ref())
            .map(CircuitBreaker::state)
    }

    pub fn reset_circuits(&self) {
        for tool in self.tools().values() {
            if let Some(b) = &tool.breaker {
                b.reset();
            }
        }
    }
}

impl std::fmt::Debug for ToolPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPipeline")
            .field("tools", &self.tool_names())
            .finish()
    }
}

/// Router over the composed handlers. Unknown names fail with `NotFound`.
impl Service<ToolRequest> for ToolPipeline {
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
        match self.handler(&req.tool) {
            Some(handler) => Box::pin(handler.oneshot(req)),
            None => {
                let err = ToolError::not_found("tool", req.tool);
                Box::pin(async move { Err(err.into()) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::tool::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo(name: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            format!("echo for {name}"),
            handler_fn(|req: ToolRequest| async move { Ok::<_, BoxError>(req.params) }),
        )
    }

    #[test]
    fn missing_required_tools_fail_the_build() {
        let err = PipelineBuilder::new()
            .tool(echo("a"))
            .require(["a", "b", "c"])
            .build()
            .unwrap_err();
        match err {
            BuildError::MissingTools(names) => assert_eq!(names, vec!["b", "c"]),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn invalid_schema_fails_the_build() {
        let err = PipelineBuilder::new()
            .tool(echo("bad").schema(json!({ "type": 12 })))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidSchema { .. }));
    }

    #[tokio::test]
    async fn unknown_tools_are_not_found() {
        let pipeline = PipelineBuilder::new().tool(echo("a")).build().unwrap();
        let err = pipeline.call("nope", json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = pipeline
            .clone()
            .oneshot(ToolRequest::new("nope", json!({})))
            .await
            .unwrap_err();
        assert_eq!(ToolError::from_boxed("nope", err).code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn later_registration_overwrites_earlier() {
        let pipeline = PipelineBuilder::new()
            .tool(echo("a"))
            .tool(ToolDefinition::new(
                "a",
                "constant",
                handler_fn(|_req: ToolRequest| async move { Ok::<_, BoxError>(json!("second")) }),
            ))
            .build()
            .unwrap();
        assert_eq!(pipeline.tool_names(), vec!["a"]);
        assert_eq!(pipeline.call("a", json!({})).await.unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn live_registration_refreshes_catalog_and_drops_cached_results() {
        let pipeline = PipelineBuilder::new().tool(echo("a")).build().unwrap();
        pipeline.call("a", json!({ "x": 1 })).await.unwrap();
        assert_eq!(pipeline.cache_size(), 1);

        let first = pipeline.list_tools();
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &pipeline.list_tools()));

        pipeline
            .register(ToolDefinition::new(
                "a",
                "replaced",
                handler_fn(|_req: ToolRequest| async move { Ok::<_, BoxError>(json!(0)) }),
            ))
            .unwrap();
        pipeline.register(echo("b")).unwrap();

        assert_eq!(pipeline.cache_size(), 0);
        let catalog = pipeline.list_tools();
        let names: Vec<_> = catalog.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(catalog[0].description, "replaced");
    }

    fn constant_after(name: &str, value: &'static str, delay_ms: u64) -> ToolDefinition {
        ToolDefinition::new(
            name,
            value,
            handler_fn(move |_req: ToolRequest| async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                Ok::<_, BoxError>(json!(value))
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn calls_in_flight_during_replacement_do_not_poison_the_cache() {
        let pipeline = PipelineBuilder::new()
            .tool(constant_after("t", "old", 100))
            .build()
            .unwrap();

        let p = pipeline.clone();
        let in_flight = tokio::spawn(async move { p.call("t", json!({ "id": 1 })).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pipeline.register(constant_after("t", "new", 0)).unwrap();

        assert_eq!(in_flight.await.unwrap().unwrap(), json!("old"));
        assert_eq!(pipeline.cache_size(), 0);
        assert_eq!(pipeline.call("t", json!({ "id": 1 })).await.unwrap(), json!("new"));
        assert_eq!(pipeline.call("t", json!({ "id": 1 })).await.unwrap(), json!("new"));
        assert_eq!(pipeline.cache_size(), 1);
    }

    #[test]
    fn catalog_stays_current_under_concurrent_registration() {
        let pipeline = PipelineBuilder::new().tool(echo("t0")).build().unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let p = &pipeline;
                scope.spawn(move || {
                    for _ in 0..200 {
                        p.list_tools();
                    }
                });
            }
            for i in 1..50 {
                pipeline.register(echo(&format!("t{i}"))).unwrap();
            }
        });
        assert_eq!(pipeline.list_tools().len(), 50);
    }

    #[test]
    fn per_tool_cache_capacity_is_rejected() {
        let capped = || echo("a").options(PipelineOptions::default().cache_max_size(5));
        let err = PipelineBuilder::new().tool(capped()).build().unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnsupportedOverride { option: "cacheMaxSize", .. }
        ));

        let pipeline = PipelineBuilder::new().build().unwrap();
        assert!(pipeline.register(capped()).is_err());
        assert!(!pipeline.contains("a"));
    }

    #[tokio::test]
    async fn every_call_gets_a_fresh_context_with_shared_env() {
        #[derive(Debug)]
        struct Tenant(&'static str);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        let pipeline = PipelineBuilder::new()
            .options(PipelineOptions::default().caching(false))
            .env(CapabilityEnv::builder().with_capability(Arc::new(Tenant("acme"))).build())
            .tool(ToolDefinition::new(
                "who",
                "tenant lookup",
                handler_fn(move |req: ToolRequest| {
                    s.lock().unwrap().push(req.context.correlation_id);
                    let tenant = req.context.env.capability::<Tenant>().map(|t| t.0);
                    async move { Ok::<_, BoxError>(json!(tenant)) }
                }),
            ))
            .build()
            .unwrap();

        assert_eq!(pipeline.call("who", json!({})).await.unwrap(), json!("acme"));
        pipeline.call("who", json!({})).await.unwrap();
        let ids = seen.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn per_tool_options_override_globals() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let pipeline = PipelineBuilder::new()
            .options(PipelineOptions::default().retry_delay(std::time::Duration::from_millis(1)))
            .tool(
                ToolDefinition::new(
                    "flaky",
                    "always fails",
                    handler_fn(move |_req: ToolRequest| {
                        c.fetch_add(1, Ordering::SeqCst);
                        async move { Err::<Value, BoxError>(ToolError::network("down").into()) }
                    }),
                )
                .options(PipelineOptions::default().max_retries(1).circuit_breaker(false)),
            )
            .build()
            .unwrap();

        let err = pipeline.call("flaky", json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RetryExhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(pipeline.circuit("flaky").is_none());
    }
}
