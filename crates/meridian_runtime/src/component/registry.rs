// Component Registry - Maps type tags to schemas and constructors
//
// Filled once at startup. The resolver validates configured components
// against the schemas; the lifecycle manager builds instances through the
// factories.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Component, ComponentSchema};
use crate::allocation::ComponentBinding;
use crate::error::ConfigError;

/// Builds a component instance for a resolved binding
pub type ComponentFactory =
    Arc<dyn Fn(&ComponentBinding) -> Result<Box<dyn Component>, ConfigError> + Send + Sync>;

struct ComponentEntry {
    schema: ComponentSchema,
    factory: ComponentFactory,
}

/// Registry of all available component types
#[derive(Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, ComponentEntry>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type; a later registration replaces an earlier one
    pub fn register(&mut self, type_tag: impl Into<String>, schema: ComponentSchema, factory: ComponentFactory) {
        self.entries
            .insert(type_tag.into(), ComponentEntry { schema, factory });
    }

    /// Register a component type from a plain constructor function
    pub fn register_fn<F>(&mut self, type_tag: impl Into<String>, schema: ComponentSchema, func: F)
    where
        F: Fn(&ComponentBinding) -> Result<Box<dyn Component>, ConfigError> + Send + Sync + 'static,
    {
        self.register(type_tag, schema, Arc::new(func));
    }

    pub fn schema(&self, type_tag: &str) -> Option<&ComponentSchema> {
        self.entries.get(type_tag).map(|e| &e.schema)
    }

    /// Construct an instance for `binding`
    pub fn create(&self, binding: &ComponentBinding) -> Result<Box<dyn Component>, ConfigError> {
        let entry = self
            .entries
            .get(&binding.component_type)
            .ok_or_else(|| ConfigError::UnknownComponentType {
                id: binding.id.clone(),
                component_type: binding.component_type.clone(),
            })?;
        (entry.factory)(binding)
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.entries.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.type_tags().collect();
        tags.sort_unstable();
        f.debug_struct("ComponentRegistry").field("types", &tags).finish()
    }
}
