//! Capability-based environment injected into every call.
//!
//! Shared collaborator handles (record stores, clients, clocks) are registered
//! once at startup and looked up by type from the call-scoped context, so
//! handlers never reach for globals.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Builder for creating environments with capabilities.
///
/// # Example
///
/// ```
/// use tower_tool_pipeline::env::EnvBuilder;
/// use std::sync::Arc;
///
/// struct Greeting(&'static str);
///
/// let env = EnvBuilder::new()
///     .with_capability(Arc::new(Greeting("hello")))
///     .build();
/// assert_eq!(env.capability::<Greeting>().unwrap().0, "hello");
/// ```
#[derive(Default)]
pub struct EnvBuilder {
    capabilities: Vec<Arc<dyn Any + Send + Sync>>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability. A later capability of the same type shadows earlier ones.
    pub fn with_capability<T: Any + Send + Sync>(mut self, capability: Arc<T>) -> Self {
        self.capabilities
            .push(capability as Arc<dyn Any + Send + Sync>);
        self
    }

    pub fn build(self) -> CapabilityEnv {
        CapabilityEnv {
            capabilities: Arc::new(self.capabilities),
        }
    }
}

/// Type-erased, cheaply clonable bag of shared collaborators.
#[derive(Clone, Default)]
pub struct CapabilityEnv {
    capabilities: Arc<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl CapabilityEnv {
    /// Environment with no capabilities.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> EnvBuilder {
        EnvBuilder::new()
    }

    /// Get a typed capability, most recently registered first.
    pub fn capability<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.capabilities
            .iter()
            .rev()
            .find_map(|cap| cap.clone().downcast::<T>().ok())
    }

    pub fn has_capability<T: Any + Send + Sync>(&self) -> bool {
        self.capability::<T>().is_some()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for CapabilityEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityEnv")
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);
    struct Label(&'static str);

    #[test]
    fn empty_env_has_no_capabilities() {
        let env = CapabilityEnv::empty();
        assert!(env.is_empty());
        assert!(!env.has_capability::<Counter>());
    }

    #[test]
    fn capabilities_resolve_by_type() {
        let env = CapabilityEnv::builder()
            .with_capability(Arc::new(Counter(7)))
            .with_capability(Arc::new(Label("store")))
            .build();

        assert_eq!(env.capability::<Counter>().map(|c| c.0), Some(7));
        assert_eq!(env.capability::<Label>().map(|l| l.0), Some("store"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn later_capability_shadows_earlier() {
        let env = EnvBuilder::new()
            .with_capability(Arc::new(Counter(1)))
            .with_capability(Arc::new(Counter(2)))
            .build();
        assert_eq!(env.capability::<Counter>().map(|c| c.0), Some(2));
    }

    #[test]
    fn clones_share_the_same_handles() {
        let counter = Arc::new(Counter(3));
        let env = EnvBuilder::new().with_capability(counter.clone()).build();
        let copy = env.clone();
        let resolved = copy.capability::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&resolved, &counter));
    }
}
