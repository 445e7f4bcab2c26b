//! Error taxonomy
//!
//! `ConfigError` is fatal and only raised at startup. The other kinds are
//! collected per cycle and surface in the cycle report.

use meridian_types::InterfaceKind;

use crate::component::LifecycleState;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: interface '{interface}' is not enabled")]
    InterfaceNotEnabled { key: String, interface: InterfaceKind },

    #[error("{key}: no interface given and {enabled} interfaces are enabled")]
    AmbiguousInterface { key: String, enabled: usize },

    #[error("{key}: no interface is enabled")]
    NoInterfaceEnabled { key: String },

    #[error("{key}: unrecognized unit '{unit}'")]
    UnknownUnit { key: String, unit: String },

    #[error("{key}: default value of type {found} is not valid for unit {unit}")]
    IncompatibleDefault {
        key: String,
        unit: String,
        found: &'static str,
    },

    #[error("duplicate key '{0}'")]
    DuplicateKey(String),

    #[error("duplicate component id '{0}'")]
    DuplicateComponentId(String),

    #[error("component '{0}' is not present in the configuration")]
    UnknownComponent(String),

    #[error("component '{id}': unknown component type '{component_type}'")]
    UnknownComponentType { id: String, component_type: String },

    #[error("component '{id}': missing required {section} '{port}'")]
    MissingPort {
        id: String,
        section: &'static str,
        port: String,
    },

    #[error("component '{id}': {reason}")]
    InvalidComponent { id: String, reason: String },

    #[error("outputs '{first}' and '{second}' both resolve to {address}")]
    AmbiguousOutput {
        first: String,
        second: String,
        address: String,
    },

    #[error("invalid timing: {0}")]
    InvalidTiming(String),

    #[error("interface '{0}' is enabled but no adapter is available for it")]
    UnsupportedInterface(InterfaceKind),

    #[error("failed to load configuration: {0}")]
    Load(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Interfaces
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("source unavailable for {address}: {reason}")]
    SourceUnavailable { address: String, reason: String },

    #[error("write rejected for {address}: {reason}")]
    WriteRejected { address: String, reason: String },

    #[error("deadline exceeded for {address}")]
    DeadlineExceeded { address: String },

    #[error("no adapter registered for interface '{0}'")]
    NoAdapter(InterfaceKind),
}

impl AdapterError {
    pub fn unavailable(address: impl ToString, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn rejected(address: impl ToString, reason: impl Into<String>) -> Self {
        Self::WriteRejected {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Components
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComponentError {
    #[error("missing inputs: {}", .0.join(", "))]
    MissingInput(Vec<String>),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unit mismatch for '{key}': expected {expected}, found {found}")]
    UnitMismatch {
        key: String,
        expected: String,
        found: String,
    },

    #[error("calculation failed: {0}")]
    Calculation(String),

    #[error("unknown output '{0}'")]
    UnknownOutput(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("component '{id}': cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}
