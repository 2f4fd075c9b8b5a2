//! Provider factory registry
//!
//! Maps provider type names from the configuration to factories. The
//! registry is built once at startup and frozen; registering the same
//! name twice is a programming error and aborts the process.

use std::collections::HashMap;
use std::sync::Arc;

use jg_core::{Diagnostic, Diagnostics, Provider, TargetConfig};

/// Builds a provider from a target's raw option table.
pub type ProviderFactory =
    fn(target: &str, options: &toml::Table) -> Result<Arc<dyn Provider>, Diagnostics>;

/// Registry of provider factories, keyed by type name.
pub struct ProviderRegistry {
    factories: HashMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in provider type.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("forward", crate::forward::factory);
        registry.register("virtualbox", crate::virtualbox::factory);
        registry
    }

    /// Register a factory under a type name.
    ///
    /// # Panics
    ///
    /// Panics when `name` is already registered.
    pub fn register(&mut self, name: &'static str, factory: ProviderFactory) {
        if self.factories.insert(name, factory).is_some() {
            panic!("provider type {:?} registered twice", name);
        }
    }

    /// Build the provider for one configured target.
    pub fn create(
        &self,
        target: &str,
        config: &TargetConfig,
    ) -> Result<Arc<dyn Provider>, Diagnostics> {
        match self.factories.get(config.provider.as_str()) {
            Some(factory) => factory(target, &config.options),
            None => Err(Diagnostic::error(format!(
                "unknown provider type {:?} for target {:?}",
                config.provider, target
            ))
            .into()),
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
