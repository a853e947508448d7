//! Traits a model implements to be split and run layer by layer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ir::Value;
use crate::trace::{Proxy, Tracer};

/// A callable sub-component of a model (a convolution, a linear layer...).
///
/// Layer functions invoke components with the values bound to the call's
/// arguments, in order.
pub trait Component: Send + Sync {
    fn forward(&self, args: &[Value]) -> crate::Result<Value>;
}

impl<F> Component for F
where
    F: Fn(&[Value]) -> crate::Result<Value> + Send + Sync,
{
    fn forward(&self, args: &[Value]) -> crate::Result<Value> {
        self(args)
    }
}

/// Name → component table, resolved once when layers are compiled.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: HashMap<String, Arc<dyn Component>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component` under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, component: Arc<dyn Component>) {
        self.components.insert(name.into(), component);
    }

    pub fn with(mut self, name: impl Into<String>, component: Arc<dyn Component>) -> Self {
        self.register(name, component);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Component>> {
        self.components.get(name)
    }

    pub fn resolve(&self, name: &str) -> crate::Result<Arc<dyn Component>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| crate::LayerwiseError::UnresolvedComponent(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.components.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish()
    }
}

/// A model that can be traced and split into per-layer functions.
///
/// The first input is conventionally the full graph; each layer selects its
/// block with [`Tracer::get_block`].
pub trait Traceable {
    /// Names of the positional inputs, graph first
    fn input_names(&self) -> Vec<String>;

    /// Record the forward pass on `tracer`, returning the model's outputs
    fn forward(&self, tracer: &mut Tracer, inputs: &[Proxy]) -> crate::Result<Vec<Proxy>>;

    /// Sub-components referenced by `call_module` during the trace
    fn components(&self) -> ComponentRegistry;
}
