//! Module variant registry.
//!
//! Maps the stable name written to saved pipelines onto a constructor.
//! Renamed modules stay loadable through aliases.

use crate::module::builtin;
use crate::module::Module;
use crate::pipeline::error::{PipelineError, PipelineResult};
use std::collections::{BTreeMap, HashMap};

/// Constructor for a module with default settings.
pub type ModuleFactory = fn() -> Box<dyn Module>;

/// Name → constructor table.
#[derive(Clone)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
    aliases: HashMap<String, String>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// A registry holding every built-in module.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: ModuleFactory) -> &mut Self {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::warn!("Module {} registered twice; keeping the latest", name);
        }
        self
    }

    /// Resolve records saved under `old_name` to `new_name`.
    pub fn alias(&mut self, old_name: impl Into<String>, new_name: impl Into<String>) -> &mut Self {
        self.aliases.insert(old_name.into(), new_name.into());
        self
    }

    /// Registry name for a saved class name.
    ///
    /// Dotted class paths resolve by their last segment.
    pub fn resolve_name<'a>(&'a self, class_name: &'a str) -> &'a str {
        let short = class_name.rsplit('.').next().unwrap_or(class_name);
        self.aliases
            .get(short)
            .map(String::as_str)
            .unwrap_or(short)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(self.resolve_name(class_name))
    }

    /// Construct a module with default settings.
    pub fn create(&self, class_name: &str) -> PipelineResult<Box<dyn Module>> {
        let name = self.resolve_name(class_name);
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownModule(class_name.to_string()))
    }

    /// Registered names in alphabetical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.factories.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let registry = ModuleRegistry::with_builtins();
        for name in ["LoadImages", "MeasureImageIntensity", "FlagImage", "CalculateGroupMean"] {
            let module = registry.create(name).unwrap();
            assert_eq!(module.module_name(), name);
        }
    }

    #[test]
    fn test_dotted_and_aliased_names() {
        let mut registry = ModuleRegistry::with_builtins();
        registry.alias("FlagImages", "FlagImage");
        assert!(registry.contains("cellpipe.modules.LoadImages"));
        assert_eq!(registry.create("FlagImages").unwrap().module_name(), "FlagImage");
    }

    #[test]
    fn test_unknown_module() {
        let registry = ModuleRegistry::new();
        let err = registry.create("IdentifyPrimaryObjects").err().unwrap();
        assert!(matches!(err, PipelineError::UnknownModule(n) if n == "IdentifyPrimaryObjects"));
    }
}
