//! Per-cycle data bundles
//!
//! `InputDataModel` is what a cycle reads, `DataTransferModel` is what a
//! calculation hands back for writing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interface::InterfaceKind;
use crate::units::Unit;
use crate::value::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Addressing
// ─────────────────────────────────────────────────────────────────────────────

/// Physical address of a point on one interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointAddress {
    pub entity: String,
    pub attribute: String,
    pub interface: InterfaceKind,
    /// Identifier of the attribute on the transport, when it differs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_interface: Option<String>,
}

impl PointAddress {
    pub fn new(
        entity: impl Into<String>,
        attribute: impl Into<String>,
        interface: InterfaceKind,
    ) -> Self {
        Self {
            entity: entity.into(),
            attribute: attribute.into(),
            interface,
            attribute_interface: None,
        }
    }

    pub fn with_attribute_interface(mut self, id: impl Into<String>) -> Self {
        self.attribute_interface = Some(id.into());
        self
    }

    /// Attribute identifier as the transport knows it
    pub fn transport_attribute(&self) -> &str {
        self.attribute_interface.as_deref().unwrap_or(&self.attribute)
    }
}

impl fmt::Display for PointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.interface, self.entity, self.attribute)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Readings
// ─────────────────────────────────────────────────────────────────────────────

/// Which pass a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Calculation,
    Calibration,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Calculation => f.write_str("calculation"),
            CycleKind::Calibration => f.write_str("calibration"),
        }
    }
}

/// Where a reading came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    #[default]
    Live,
    /// The read failed and the configured default was substituted
    Default,
}

/// A value as returned by an interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: Value,
    pub unit: Option<Unit>,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(value: impl Into<Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            unit: None,
            timestamp,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// One assembled input or static point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPoint {
    pub key: String,
    pub address: PointAddress,
    pub value: Value,
    pub unit: Option<Unit>,
    pub timestamp: DateTime<Utc>,
    pub provenance: Provenance,
}

impl InputPoint {
    pub fn is_default(&self) -> bool {
        self.provenance == Provenance::Default
    }
}

/// The last value written to an output point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub key: String,
    pub address: PointAddress,
    pub value: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// InputDataModel
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of everything read for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDataModel {
    pub kind: CycleKind,
    /// Reference time of the cycle; range reads end here
    pub timestamp: DateTime<Utc>,
    pub inputs: Vec<InputPoint>,
    pub static_data: Vec<InputPoint>,
    pub last_outputs: Vec<OutputSnapshot>,
    /// Keys whose read failed without a default
    pub missing: Vec<String>,
}

impl InputDataModel {
    pub fn new(kind: CycleKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            inputs: Vec::new(),
            static_data: Vec::new(),
            last_outputs: Vec::new(),
            missing: Vec::new(),
        }
    }

    pub fn input(&self, key: &str) -> Option<&InputPoint> {
        self.inputs.iter().find(|p| p.key == key)
    }

    pub fn static_point(&self, key: &str) -> Option<&InputPoint> {
        self.static_data.iter().find(|p| p.key == key)
    }

    pub fn last_output(&self, key: &str) -> Option<&OutputSnapshot> {
        self.last_outputs.iter().find(|p| p.key == key)
    }

    /// Look a key up across inputs, static data and last outputs, in that order
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.input(key)
            .map(|p| &p.value)
            .or_else(|| self.static_point(key).map(|p| &p.value))
            .or_else(|| self.last_output(key).map(|p| &p.value))
    }

    pub fn is_missing(&self, key: &str) -> bool {
        self.missing.iter().any(|k| k == key)
    }

    /// Number of points that fell back to their default
    pub fn default_count(&self) -> usize {
        self.inputs
            .iter()
            .chain(self.static_data.iter())
            .filter(|p| p.is_default())
            .count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DataTransferModel
// ─────────────────────────────────────────────────────────────────────────────

/// One value to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPoint {
    pub entity: String,
    pub attribute: String,
    /// Disambiguates when the same entity attribute is declared on several interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<InterfaceKind>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ResultPoint {
    pub fn new(entity: impl Into<String>, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            attribute: attribute.into(),
            interface: None,
            value: value.into(),
            unit: None,
            timestamp: None,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn on_interface(mut self, interface: InterfaceKind) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Timestamp the write is tagged with: the explicit one, else the newest
    /// sample of a series, else `fallback`
    pub fn governing_timestamp(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .or_else(|| self.value.as_series().and_then(|s| s.latest_time()))
            .unwrap_or(fallback)
    }
}

/// Result set of one calculation or calibration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTransferModel {
    pub points: Vec<ResultPoint>,
}

impl DataTransferModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: ResultPoint) {
        self.points.push(point);
    }

    pub fn extend(&mut self, other: DataTransferModel) {
        self.points.extend(other.points);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultPoint> {
        self.points.iter()
    }
}

impl FromIterator<ResultPoint> for DataTransferModel {
    fn from_iter<I: IntoIterator<Item = ResultPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}
