//! Pluggable Sub-Components
//!
//! A component is a small calculator bound to a slice of the allocation
//! table. Each implementation declares a [`ComponentSchema`] naming the
//! ports it expects, and is selected at startup through the
//! [`ComponentRegistry`] by its type tag.
//!
//! # Capabilities
//!
//! - `prepare`: one-time setup from constants and static data
//! - `set_input_values`: receives this cycle's inputs
//! - `calculate`: produces the value of one declared output
//! - `calibrate`: re-reads static data (defaults to `prepare`)

mod lifecycle;
mod registry;

pub use lifecycle::*;
pub use registry::*;

use std::collections::BTreeMap;

use serde::Serialize;

use meridian_types::{Provenance, Unit, Value};

use crate::error::ComponentError;

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

/// One named port of a component type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    /// Expected unit; a differing declared unit only produces a warning
    pub unit: Option<Unit>,
    pub required: bool,
}

impl PortSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            required: false,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// Ports a component type understands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentSchema {
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    /// Satisfied either by a static-data allocation or a `config` constant
    pub static_data: Vec<PortSpec>,
}

impl ComponentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn static_port(mut self, port: PortSpec) -> Self {
        self.static_data.push(port);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component Data
// ─────────────────────────────────────────────────────────────────────────────

/// A value handed to a component, keyed by its local port name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentValue {
    pub value: Value,
    pub unit: Option<Unit>,
    pub provenance: Provenance,
}

impl ComponentValue {
    pub fn new(value: impl Into<Value>, unit: Option<Unit>) -> Self {
        Self {
            value: value.into(),
            unit,
            provenance: Provenance::Live,
        }
    }
}

/// Named values passed into a component
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentData {
    values: BTreeMap<String, ComponentValue>,
}

impl ComponentData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ComponentValue) {
        self.values.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>, unit: Option<Unit>) -> Self {
        self.insert(key, ComponentValue::new(value, unit));
        self
    }

    pub fn get(&self, key: &str) -> Option<&ComponentValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn require(&self, key: &str) -> Result<&ComponentValue, ComponentError> {
        self.values
            .get(key)
            .ok_or_else(|| ComponentError::MissingInput(vec![key.to_string()]))
    }

    /// Required numeric value (newest sample for a series)
    pub fn require_f64(&self, key: &str) -> Result<f64, ComponentError> {
        let entry = self.require(key)?;
        entry.value.as_f64().ok_or_else(|| ComponentError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a number, found {}", entry.value.kind_name()),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Capability set implemented by every component variant
///
/// Calls for one instance are never concurrent; the lifecycle manager owns
/// the instance and drives it through its state machine.
pub trait Component: Send + Sync {
    /// One-time setup from `config` constants merged with static data
    fn prepare(&mut self, static_data: &ComponentData) -> Result<(), ComponentError>;

    /// Receive this cycle's inputs, keyed by local input name
    fn set_input_values(&mut self, inputs: &ComponentData) -> Result<(), ComponentError>;

    /// Produce the value of one declared output
    fn calculate(&mut self, output: &str) -> Result<Value, ComponentError>;

    /// Unit of the last value produced for `output`, if the component knows it
    fn output_unit(&self, _output: &str) -> Option<Unit> {
        None
    }

    /// Refresh from new static data
    fn calibrate(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
        self.prepare(static_data)
    }
}
