//! Configuration Loader
//!
//! Reads the JSON service configuration and overlays `MERIDIAN_CONFIG_*`
//! environment variables, with `__` separating nested keys
//! (`MERIDIAN_CONFIG_CONTROLLER_SETTINGS__DEADLINE_MARGIN_MS=250`).

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Json};
use tracing::info;

use meridian_runtime::{ConfigError, ConfigModel};

pub const CONFIG_ENV_PREFIX: &str = "MERIDIAN_CONFIG_";

/// Load the configuration file with its environment overlay
pub fn load_config(path: &Path) -> Result<ConfigModel, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Load(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }

    let config: ConfigModel = Figment::new()
        .merge(Json::file(path))
        .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    info!(
        path = %path.display(),
        name = %config.name,
        inputs = config.inputs.len(),
        outputs = config.outputs.len(),
        components = config.controller_components.len(),
        "Loaded configuration"
    );
    Ok(config)
}
