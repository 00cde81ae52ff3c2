use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::handler::Handler;

/// Lookup table from module name to its handler.
///
/// Exactly one entry is active at runtime: the one named by the function's
/// `module` setting. The runtime resolves it once at construction, so a
/// missing module is reported before any broker connection is made.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `module`, replacing any previous entry.
    pub fn register<H: Handler>(&mut self, module: impl Into<String>, handler: H) {
        let module = module.into();
        if self.handlers.contains_key(&module) {
            tracing::warn!(module = %module, "replacing registered handler");
        }
        self.handlers.insert(module, Arc::new(handler));
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with<H: Handler>(mut self, module: impl Into<String>, handler: H) -> Self {
        self.register(module, handler);
        self
    }

    /// Retrieves the handler registered for `module`.
    #[must_use]
    pub fn get(&self, module: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(module).cloned()
    }

    /// Returns `true` if a handler is registered for `module`.
    #[must_use]
    pub fn contains(&self, module: &str) -> bool {
        self.handlers.contains_key(module)
    }

    /// Registered module names, sorted.
    #[must_use]
    pub fn modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("modules", &self.modules())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> impl Handler {
        handler_fn(|_ctx, _data| Ok(None))
    }

    #[test]
    fn register_and_get() {
        let registry = HandlerRegistry::new()
            .with("module1", noop())
            .with("module2", noop());

        assert_eq!(registry.len(), 2);
        assert!(registry.get("module1").is_some());
        assert!(registry.contains("module2"));
        assert_eq!(registry.modules(), vec!["module1", "module2"]);
    }

    #[test]
    fn unknown_module_returns_none() {
        let registry = HandlerRegistry::new().with("string", noop());
        assert!(registry.get("other").is_none());
        assert!(!registry.contains("other"));
    }

    #[test]
    fn register_replaces_existing_entry() {
        let mut registry = HandlerRegistry::new();
        registry.register("string", noop());
        registry.register("string", noop());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_registry() {
        let registry = HandlerRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(format!("{registry:?}"), "HandlerRegistry { modules: [] }");
    }
}
