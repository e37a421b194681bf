use crate::adapter::{Dependencies, DynAdapter};
use crate::IngestError;
use std::collections::BTreeMap;
use std::sync::Arc;

type Factory = Box<dyn Fn(Dependencies) -> Arc<dyn DynAdapter> + Send + Sync>;

/// Process-wide mapping from source name to adapter factory. Built once at
/// startup and read-only afterwards; factories receive their dependencies
/// injected at build time.
pub struct Registry {
    factories: BTreeMap<&'static str, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// All first-party sources.
    pub fn with_builtin_sources() -> Self {
        let mut registry = Self::new();
        crate::sources::register_all(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        factory: impl Fn(Dependencies) -> Arc<dyn DynAdapter> + Send + Sync + 'static,
    ) {
        self.factories.insert(name, Box::new(factory));
    }

    /// Instantiate the adapter registered under `name`.
    pub fn build(&self, name: &str, deps: Dependencies) -> Result<Arc<dyn DynAdapter>, IngestError> {
        match self.factories.get(name) {
            Some(factory) => {
                tracing::debug!(adapter = name, "built adapter");
                Ok(factory(deps))
            }
            None => Err(IngestError::UnknownAdapter {
                name: name.to_string(),
                known: self.names().iter().map(|n| n.to_string()).collect(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtin_sources()
    }
}
