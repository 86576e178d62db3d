//! Decoration primitive: turn one [`ToolHandler`] into another with the same signature.
//!
//! Decorators never mutate the handler they wrap; each one returns a new
//! handler holding the wrapped one. A [`DecoratorStack`] composes them with a
//! left fold at startup in the fixed stage order, outermost first:
//!
//! ```text
//! Observability → Caching → Validation → Resilience → Base
//! ```
//!
//! Caching sits outside Validation, so a cache hit bypasses validation and
//! retries entirely. Entries are only written after a successful pass through
//! the inner chain, so a hit implies the input validated before.

use std::sync::Arc;

use serde_json::Value;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, Service};

use crate::tool::{ToolHandler, ToolRequest};

/// Position of a decorator in the chain. Declaration order is outer → inner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Observability,
    Caching,
    Validation,
    Resilience,
}

/// Object-safe wrap interface for boxed tool handlers.
pub trait ToolDecorator: Send + Sync {
    fn stage(&self) -> Stage;

    /// Wrap `inner` for the tool named `tool`.
    fn decorate(&self, tool: &str, inner: ToolHandler) -> ToolHandler;
}

/// Lift any Tower layer producing a clonable tool service into a decorator.
pub struct LayerDecorator<L> {
    stage: Stage,
    layer: L,
}

impl<L> LayerDecorator<L> {
    pub fn new(stage: Stage, layer: L) -> Self {
        Self { stage, layer }
    }
}

impl<L> ToolDecorator for LayerDecorator<L>
where
    L: Layer<ToolHandler> + Send + Sync,
    L::Service: Service<ToolRequest, Response = Value, Error = BoxError> + Clone + Send + 'static,
    <L::Service as Service<ToolRequest>>::Future: Send + 'static,
{
    fn stage(&self) -> Stage {
        self.stage
    }

    fn decorate(&self, _tool: &str, inner: ToolHandler) -> ToolHandler {
        BoxCloneService::new(self.layer.layer(inner))
    }
}

/// Ordered list of decorators composed around a base handler.
#[derive(Clone, Default)]
pub struct DecoratorStack {
    decorators: Vec<Arc<dyn ToolDecorator>>,
}

impl DecoratorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, decorator: impl ToolDecorator + 'static) -> Self {
        self.decorators.push(Arc::new(decorator));
        self
    }

    pub fn push_shared(mut self, decorator: Arc<dyn ToolDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn len(&self) -> usize {
        self.decorators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decorators.is_empty()
    }

    /// Stages in effective order, outermost first. Within a stage, push order
    /// is preserved (first pushed is outermost).
    pub fn stages(&self) -> Vec<Stage> {
        self.ordered().iter().map(|d| d.stage()).collect()
    }

    fn ordered(&self) -> Vec<Arc<dyn ToolDecorator>> {
        let mut ordered = self.decorators.clone();
        ordered.sort_by_key(|d| d.stage());
        ordered
    }

    /// Fold the stack around `base`, innermost decorator first.
    pub fn compose(&self, tool: &str, base: ToolHandler) -> ToolHandler {
        self.ordered()
            .iter()
            .rev()
            .fold(base, |inner, decorator| decorator.decorate(tool, inner))
    }
}
