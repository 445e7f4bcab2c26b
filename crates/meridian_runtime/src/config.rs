//! Service Configuration Model
//!
//! Typed form of the JSON configuration file. The model is deserialized once
//! at startup, validated by the allocation resolver and then shared
//! read-only for the lifetime of the process.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meridian_types::{Granularity, InterfaceKind, Value};

use crate::error::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

/// Root of the service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigModel {
    /// Documentation only
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub interfaces: InterfaceSet,

    #[serde(default)]
    pub inputs: BTreeMap<String, IoAllocation>,

    #[serde(default)]
    pub outputs: BTreeMap<String, IoAllocation>,

    #[serde(default, rename = "staticdata")]
    pub static_data: BTreeMap<String, IoAllocation>,

    /// Executed in this order every cycle
    #[serde(default)]
    pub controller_components: Vec<ComponentConfig>,

    pub controller_settings: ControllerSettings,
}

impl ConfigModel {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Look up a component configuration by id
    pub fn component(&self, id: &str) -> Option<&ComponentConfig> {
        self.controller_components.iter().find(|c| c.id == id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interfaces
// ─────────────────────────────────────────────────────────────────────────────

/// Which transports are switched on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSet {
    #[serde(default, alias = "fiware")]
    pub context: bool,
    #[serde(default)]
    pub timeseries: bool,
    #[serde(default)]
    pub mqtt: bool,
    #[serde(default)]
    pub file: bool,
}

impl InterfaceSet {
    pub fn is_enabled(&self, kind: InterfaceKind) -> bool {
        match kind {
            InterfaceKind::Context => self.context,
            InterfaceKind::Timeseries => self.timeseries,
            InterfaceKind::Mqtt => self.mqtt,
            InterfaceKind::File => self.file,
        }
    }

    pub fn enabled(&self) -> Vec<InterfaceKind> {
        InterfaceKind::ALL
            .into_iter()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }

    pub fn only(kind: InterfaceKind) -> Self {
        let mut set = Self::default();
        set.enable(kind);
        set
    }

    pub fn enable(&mut self, kind: InterfaceKind) {
        match kind {
            InterfaceKind::Context => self.context = true,
            InterfaceKind::Timeseries => self.timeseries = true,
            InterfaceKind::Mqtt => self.mqtt = true,
            InterfaceKind::File => self.file = true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IO Allocation
// ─────────────────────────────────────────────────────────────────────────────

/// Point read or range read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    #[default]
    #[serde(alias = "value")]
    Point,
    #[serde(alias = "timeseries")]
    Range,
}

/// One declared input, output or static-data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoAllocation {
    pub entity: String,
    pub attribute: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<InterfaceKind>,

    /// Unit code, validated by the resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_mode: Option<ReadMode>,

    /// Identifier of the attribute on the transport (e.g. a CSV column)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_interface: Option<String>,
}

impl IoAllocation {
    pub fn new(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            attribute: attribute.into(),
            interface: None,
            unit: None,
            default: None,
            read_mode: None,
            attribute_interface: None,
        }
    }

    pub fn with_interface(mut self, interface: InterfaceKind) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = Some(mode);
        self
    }

    /// Fill every unset optional field from `parent`
    pub fn inherit_from(&self, parent: &IoAllocation) -> IoAllocation {
        IoAllocation {
            entity: self.entity.clone(),
            attribute: self.attribute.clone(),
            interface: self.interface.or(parent.interface),
            unit: self.unit.clone().or_else(|| parent.unit.clone()),
            default: self.default.clone().or_else(|| parent.default.clone()),
            read_mode: self.read_mode.or(parent.read_mode),
            attribute_interface: self
                .attribute_interface
                .clone()
                .or_else(|| parent.attribute_interface.clone()),
        }
    }

    pub fn same_point(&self, other: &IoAllocation) -> bool {
        self.entity == other.entity && self.attribute == other.attribute
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Components
// ─────────────────────────────────────────────────────────────────────────────

/// Constant data point from a component's `config` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPoint {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Sub-component configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub component_type: String,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub inputs: BTreeMap<String, IoAllocation>,

    #[serde(default)]
    pub outputs: BTreeMap<String, IoAllocation>,

    #[serde(default, rename = "staticdata")]
    pub static_data: BTreeMap<String, IoAllocation>,

    #[serde(default)]
    pub config: BTreeMap<String, ConstantPoint>,
}

fn default_active() -> bool {
    true
}

impl ComponentConfig {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            active: true,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            static_data: BTreeMap::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn input(mut self, key: impl Into<String>, allocation: IoAllocation) -> Self {
        self.inputs.insert(key.into(), allocation);
        self
    }

    pub fn output(mut self, key: impl Into<String>, allocation: IoAllocation) -> Self {
        self.outputs.insert(key.into(), allocation);
        self
    }

    pub fn static_point(mut self, key: impl Into<String>, allocation: IoAllocation) -> Self {
        self.static_data.insert(key.into(), allocation);
        self
    }

    pub fn constant(mut self, key: impl Into<String>, value: impl Into<Value>, unit: Option<&str>) -> Self {
        self.config.insert(
            key.into(),
            ConstantPoint {
                value: value.into(),
                unit: unit.map(String::from),
            },
        );
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub time_settings: TimeSettings,

    /// Subtracted from the cycle interval to give the per-cycle I/O deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_margin_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSettings {
    pub calculation: CycleTiming,

    /// Absent means static data is loaded once and never recalibrated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CycleTiming>,
}

/// Schedule and history window of one cycle kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleTiming {
    pub sampling_time: u32,
    pub sampling_time_unit: Granularity,

    #[serde(default = "default_timerange")]
    pub timerange: u32,

    /// Falls back to `sampling_time_unit`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timerange_unit: Option<Granularity>,

    #[serde(default)]
    pub run_on_startup: bool,
}

fn default_timerange() -> u32 {
    1
}

impl CycleTiming {
    pub fn new(sampling_time: u32, unit: Granularity) -> Self {
        Self {
            sampling_time,
            sampling_time_unit: unit,
            timerange: 1,
            timerange_unit: None,
            run_on_startup: false,
        }
    }

    pub fn with_range(mut self, timerange: u32, unit: Granularity) -> Self {
        self.timerange = timerange;
        self.timerange_unit = Some(unit);
        self
    }

    pub fn interval(&self) -> Duration {
        self.sampling_time_unit.span(self.sampling_time)
    }

    pub fn range(&self) -> Duration {
        self.timerange_unit
            .unwrap_or(self.sampling_time_unit)
            .span(self.timerange)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.sampling_time == 0 {
            return Err(ConfigError::InvalidTiming(format!(
                "{name}: sampling_time must be greater than zero"
            )));
        }
        if self.timerange == 0 {
            return Err(ConfigError::InvalidTiming(format!(
                "{name}: timerange must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Validated durations derived from the controller settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub calculation_interval: Duration,
    pub calculation_range: Duration,
    pub calibration_interval: Option<Duration>,
    pub calibration_range: Option<Duration>,
    pub calibrate_on_startup: bool,
    /// I/O deadline of a cycle, shared by calibration cycles since they run
    /// inside the same tick
    pub deadline: Duration,
    /// Time writes always get after the calculation, even past `deadline`
    pub write_budget: Duration,
}

impl Schedule {
    /// History window read by range inputs for the given cycle kind
    pub fn range_for(&self, kind: meridian_types::CycleKind) -> Duration {
        match kind {
            meridian_types::CycleKind::Calculation => self.calculation_range,
            meridian_types::CycleKind::Calibration => {
                self.calibration_range.unwrap_or(self.calculation_range)
            }
        }
    }
}

impl ControllerSettings {
    pub fn new(calculation: CycleTiming) -> Self {
        Self {
            time_settings: TimeSettings {
                calculation,
                calibration: None,
            },
            deadline_margin_ms: None,
        }
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        let calc = &self.time_settings.calculation;
        calc.validate("calculation")?;
        if let Some(cal) = &self.time_settings.calibration {
            cal.validate("calibration")?;
        }

        let interval = calc.interval();
        let margin = match self.deadline_margin_ms {
            Some(ms) => Duration::from_millis(ms),
            None => interval / 10,
        };
        if margin >= interval {
            return Err(ConfigError::InvalidTiming(format!(
                "deadline margin {margin:?} is not shorter than the cycle interval {interval:?}"
            )));
        }

        let calibration = self.time_settings.calibration.as_ref();
        Ok(Schedule {
            calculation_interval: interval,
            calculation_range: calc.range(),
            calibration_interval: calibration.map(CycleTiming::interval),
            calibration_range: calibration.map(CycleTiming::range),
            calibrate_on_startup: calibration.map(|c| c.run_on_startup).unwrap_or(false),
            deadline: interval - margin,
            write_budget: margin,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        "name": "storage-controller",
        "interfaces": { "fiware": false, "file": true },
        "inputs": {
            "temp_top": { "entity": "tank1", "attribute": "T1", "unit": "CEL",
                          "default": 55.0, "read_mode": "value" }
        },
        "outputs": { "pump": { "entity": "pump1", "attribute": "command" } },
        "staticdata": { "setpoint": { "entity": "params", "attribute": "setpoint" } },
        "controller_components": [
            { "id": "tpc", "type": "two_point_controller",
              "inputs": { "current_value": { "entity": "tank1", "attribute": "T1" } },
              "config": { "hysteresis": { "value": 5.0, "unit": "CEL" } } }
        ],
        "controller_settings": {
            "time_settings": {
                "calculation": { "sampling_time": 1, "sampling_time_unit": "minute",
                                 "timerange": 1, "timerange_unit": "hour" },
                "calibration": { "sampling_time": 1, "sampling_time_unit": "day",
                                 "timerange": 1, "timerange_unit": "month" }
            }
        }
    }"#;

    #[test]
    fn test_parse_example() {
        let config = ConfigModel::from_json_str(EXAMPLE).unwrap();

        assert_eq!(config.name, "storage-controller");
        assert_eq!(config.interfaces.enabled(), vec![InterfaceKind::File]);
        let temp = &config.inputs["temp_top"];
        assert_eq!(temp.read_mode, Some(ReadMode::Point));
        assert_eq!(temp.default, Some(Value::Float(55.0)));
        assert_eq!(config.static_data.len(), 1);

        let tpc = config.component("tpc").unwrap();
        assert!(tpc.active);
        assert_eq!(tpc.component_type, "two_point_controller");
        assert_eq!(tpc.config["hysteresis"].unit.as_deref(), Some("CEL"));
    }

    #[test]
    fn test_schedule_durations() {
        let config = ConfigModel::from_json_str(EXAMPLE).unwrap();
        let schedule = config.controller_settings.schedule().unwrap();

        assert_eq!(schedule.calculation_interval, Duration::from_secs(60));
        assert_eq!(schedule.calculation_range, Duration::from_secs(3600));
        assert_eq!(schedule.calibration_interval, Some(Duration::from_secs(86_400)));
        assert_eq!(
            schedule.calibration_range,
            Some(Duration::from_secs(30 * 24 * 3600))
        );
        // default margin is a tenth of the interval
        assert_eq!(schedule.deadline, Duration::from_secs(54));
        assert_eq!(schedule.write_budget, Duration::from_secs(6));
    }

    #[test]
    fn test_invalid_timing() {
        let settings = ControllerSettings::new(CycleTiming::new(0, Granularity::Minute));
        assert!(matches!(settings.schedule(), Err(ConfigError::InvalidTiming(_))));

        let mut settings = ControllerSettings::new(CycleTiming::new(1, Granularity::Second));
        settings.deadline_margin_ms = Some(1_000);
        assert!(matches!(settings.schedule(), Err(ConfigError::InvalidTiming(_))));
    }

    #[test]
    fn test_inherit_keeps_own_fields() {
        let parent = IoAllocation::new("tank1", "T1")
            .with_interface(InterfaceKind::File)
            .with_unit("CEL")
            .with_default(50.0);
        let child = IoAllocation::new("tank1", "T1").with_unit("KEL");

        let merged = child.inherit_from(&parent);
        assert_eq!(merged.interface, Some(InterfaceKind::File));
        assert_eq!(merged.unit.as_deref(), Some("KEL"));
        assert_eq!(merged.default, Some(Value::Float(50.0)));
    }
}
