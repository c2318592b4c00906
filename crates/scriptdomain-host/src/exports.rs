use std::collections::HashMap;

use tracing::debug;

/// Named entry point a resource exposes for external invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBinding {
    pub resource: String,
    pub export: String,
    /// Identifier private to the embedded context
    pub private_id: u64,
    /// Binding target handed back to the context on invocation
    pub binding: u64,
}

/// Export bindings keyed by (resource, export name)
///
/// Registering the same pair again replaces the previous binding; resources
/// are reloaded during development and the newest definition wins.
#[derive(Debug, Default)]
pub struct ExportRegistry {
    bindings: HashMap<(String, String), ExportBinding>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding, returning the one it replaced
    pub fn register(&mut self, binding: ExportBinding) -> Option<ExportBinding> {
        let key = (binding.resource.clone(), binding.export.clone());
        let previous = self.bindings.insert(key, binding);

        if let Some(ref previous) = previous {
            debug!(
                target: "runtime",
                "Replacing export {}:{} (was private id {})",
                previous.resource,
                previous.export,
                previous.private_id
            );
        }

        previous
    }

    pub fn resolve(&self, resource: &str, export: &str) -> Option<&ExportBinding> {
        self.bindings
            .get(&(resource.to_string(), export.to_string()))
    }

    /// Names of every export registered for a resource
    pub fn exports_of(&self, resource: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .bindings
            .values()
            .filter(|b| b.resource == resource)
            .map(|b| b.export.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}
