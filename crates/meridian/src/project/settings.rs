//! Process Settings
//!
//! Environment-level settings: where the configuration and data files live
//! and how to log. Built-in defaults are overridden by `MERIDIAN_*`
//! environment variables.

use std::path::PathBuf;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

use crate::file::FileSettings;

pub const ENV_PREFIX: &str = "MERIDIAN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Service configuration file (JSON)
    pub config_path: PathBuf,

    /// Level for the `meridian` targets when `RUST_LOG` is unset
    pub log_level: String,

    pub input_file: Option<PathBuf>,
    pub static_file: Option<PathBuf>,
    pub results_file: PathBuf,

    /// chrono format for data file timestamps without offset
    pub time_format: String,

    pub health_file: PathBuf,

    // Transport settings for interfaces served by external adapters.
    // Carried through untouched.
    pub context_url: Option<String>,
    pub context_auth: Option<String>,
    pub timeseries_url: Option<String>,
    pub mqtt_broker: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./config.json"),
            log_level: "info".into(),
            input_file: None,
            static_file: None,
            results_file: PathBuf::from("./results/results.json"),
            time_format: "%Y-%m-%d %H:%M:%S".into(),
            health_file: PathBuf::from("./health"),
            context_url: None,
            context_auth: None,
            timeseries_url: None,
            mqtt_broker: None,
        }
    }
}

impl Settings {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    /// Defaults merged with the process environment
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn file_settings(&self) -> FileSettings {
        FileSettings {
            input_file: self.input_file.clone(),
            static_file: self.static_file.clone(),
            results_file: self.results_file.clone(),
            time_format: self.time_format.clone(),
        }
    }
}
