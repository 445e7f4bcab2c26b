//! Project Setup
//!
//! Turns settings and the configuration file into a resolved allocation
//! table, the adapters for its enabled interfaces and a ready cycle runner.

mod loader;
mod settings;

pub use loader::*;
pub use settings::*;

use std::sync::Arc;

use tracing::{debug, info};

use meridian_runtime::{
    AdapterSet, AllocationTable, CalculationHook, ComponentRegistry, ConfigError, ConfigModel,
    CycleRunner, resolve,
};
use meridian_types::InterfaceKind;

use crate::components::builtin_registry;
use crate::file::FileAdapter;

/// A validated deployment
pub struct Project {
    pub settings: Settings,
    pub config: Arc<ConfigModel>,
    pub table: Arc<AllocationTable>,
    registry: ComponentRegistry,
}

impl Project {
    /// Load and resolve the configuration named by `settings`
    pub fn load(settings: Settings) -> Result<Self, ConfigError> {
        let config = load_config(&settings.config_path)?;
        Self::from_config(settings, config)
    }

    pub fn from_config(settings: Settings, config: ConfigModel) -> Result<Self, ConfigError> {
        let registry = builtin_registry();
        let table = resolve(&config, &registry)?;
        info!(
            name = %table.name,
            points = table.len(),
            components = table.components().len(),
            interfaces = ?table.interfaces.enabled(),
            "Configuration resolved"
        );

        Ok(Self {
            settings,
            config: Arc::new(config),
            table: Arc::new(table),
            registry,
        })
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Adapters this binary provides for the enabled interfaces
    ///
    /// Interfaces without a built-in adapter are left out; the cycle runner
    /// rejects them at construction.
    pub fn adapters(&self) -> Result<AdapterSet, ConfigError> {
        let mut adapters = AdapterSet::new();
        if self.table.interfaces.is_enabled(InterfaceKind::File) {
            let adapter = FileAdapter::new(self.settings.file_settings())?;
            debug!(?adapter, "File adapter ready");
            adapters.insert(Arc::new(adapter));
        }
        Ok(adapters)
    }

    /// Build a cycle runner over the built-in adapters
    pub fn runner(&self, hook: Arc<dyn CalculationHook>) -> Result<CycleRunner, ConfigError> {
        CycleRunner::new(Arc::clone(&self.table), self.adapters()?, &self.registry, hook)
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.table.name)
            .field("config_path", &self.settings.config_path)
            .field("registry", &self.registry)
            .finish()
    }
}
