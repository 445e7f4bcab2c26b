// Thermal Storage - Energy content of a layered storage tank
//
// Up to five temperature sensors are mounted top to bottom. Each sensor
// stands for the layer reaching halfway to its neighbours; the top layer
// starts at the lid and the bottom one ends at the floor. Heights are
// percent of the tank height measured from the top.
//
// Per layer the sensor's min/max temperatures bound the usable range, so
// the state of charge is the volume-weighted position of every reading
// inside its range. Once the top sensor drops into the lowest tenth of its
// range the tank counts as almost empty, whatever the lower layers read.

use meridian_runtime::{Component, ComponentData, ComponentError, ComponentSchema, PortSpec};
use meridian_types::{Unit, Value};

pub const TYPE_TAG: &str = "thermal_storage";

pub const VOLUME: &str = "volume";
pub const MEDIUM: &str = "medium";
pub const REFERENCE_TEMPERATURE: &str = "reference_temperature";

pub const STATE_OF_CHARGE: &str = "state_of_charge";
pub const ENERGY_CONTENT: &str = "energy_content";
pub const NOMINAL_ENERGY: &str = "nominal_energy";
pub const ENERGY_MINIMUM: &str = "energy_minimum";
pub const ENERGY_MAXIMUM: &str = "energy_maximum";

pub const MAX_SENSORS: usize = 5;
/// Sensors every storage must have
pub const MIN_SENSORS: usize = 3;

/// Share of the top sensor's range below which it governs the charge
const TOP_SENSOR_RESERVE: f64 = 0.1;

pub fn temperature_port(sensor: usize) -> String {
    format!("temperature_{sensor}")
}

pub fn height_port(sensor: usize) -> String {
    format!("sensor_{sensor}_height")
}

pub fn min_temperature_port(sensor: usize) -> String {
    format!("sensor_{sensor}_min_temperature")
}

pub fn max_temperature_port(sensor: usize) -> String {
    format!("sensor_{sensor}_max_temperature")
}

pub fn schema() -> ComponentSchema {
    let mut schema = ComponentSchema::new()
        .output(PortSpec::optional(STATE_OF_CHARGE).with_unit(Unit::Percent))
        .output(PortSpec::optional(ENERGY_CONTENT).with_unit(Unit::WattHour))
        .output(PortSpec::optional(NOMINAL_ENERGY).with_unit(Unit::WattHour))
        .output(PortSpec::optional(ENERGY_MINIMUM).with_unit(Unit::WattHour))
        .output(PortSpec::optional(ENERGY_MAXIMUM).with_unit(Unit::WattHour))
        .static_port(PortSpec::required(VOLUME).with_unit(Unit::CubicMetre))
        .static_port(PortSpec::optional(MEDIUM))
        .static_port(PortSpec::optional(REFERENCE_TEMPERATURE).with_unit(Unit::Celsius));

    for sensor in 1..=MAX_SENSORS {
        let port = |name: String| {
            if sensor <= MIN_SENSORS {
                PortSpec::required(name)
            } else {
                PortSpec::optional(name)
            }
        };
        schema = schema
            .input(port(temperature_port(sensor)).with_unit(Unit::Celsius))
            .static_port(port(height_port(sensor)).with_unit(Unit::Percent))
            .static_port(port(min_temperature_port(sensor)).with_unit(Unit::Celsius))
            .static_port(port(max_temperature_port(sensor)).with_unit(Unit::Celsius));
    }
    schema
}

// ─────────────────────────────────────────────────────────────────────────────
// Medium
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Medium {
    #[default]
    Water,
}

impl Medium {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "water" => Some(Medium::Water),
            _ => None,
        }
    }

    /// Specific heat capacity in kJ/(kg K)
    pub fn heat_capacity(&self) -> f64 {
        match self {
            Medium::Water => 4.19,
        }
    }

    /// Density in kg/m³
    pub fn density(&self) -> f64 {
        match self {
            Medium::Water => 997.0,
        }
    }

    /// Wh stored per m³ and kelvin
    fn energy_per_kelvin(&self) -> f64 {
        self.density() * self.heat_capacity() / 3.6
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Layer {
    sensor: usize,
    /// m³
    volume: f64,
    min_temperature: f64,
    max_temperature: f64,
}

impl Layer {
    fn range(&self) -> f64 {
        self.max_temperature - self.min_temperature
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Storage {
    volume: f64,
    medium: Medium,
    reference_temperature: Option<f64>,
    /// Top to bottom
    layers: Vec<Layer>,
}

impl Storage {
    /// Wh for the sum of `kelvin(layer) * layer volume`
    fn energy(&self, kelvin: impl Fn(&Layer) -> f64) -> f64 {
        let weighted: f64 = self.layers.iter().map(|l| kelvin(l) * l.volume).sum();
        weighted * self.medium.energy_per_kelvin()
    }

    fn nominal_energy(&self) -> f64 {
        self.energy(Layer::range)
    }

    fn reference(&self, layer: &Layer) -> f64 {
        self.reference_temperature.unwrap_or(layer.min_temperature)
    }

    fn energy_minimum(&self) -> f64 {
        self.energy(|l| l.min_temperature - self.reference(l))
    }

    fn energy_maximum(&self) -> f64 {
        self.energy(|l| l.max_temperature - self.reference(l))
    }

    /// Percent, given one temperature per layer
    fn state_of_charge(&self, temperatures: &[f64]) -> f64 {
        let charged: f64 = self
            .layers
            .iter()
            .zip(temperatures)
            .map(|(layer, t)| (t - layer.min_temperature) / layer.range() * layer.volume)
            .sum();
        let soc = (charged / self.volume * 100.0).max(0.0);

        let (Some(top), Some(&t)) = (self.layers.first(), temperatures.first()) else {
            return soc;
        };
        if t < top.min_temperature {
            0.0
        } else if t < top.min_temperature + top.range() * TOP_SENSOR_RESERVE {
            (t - top.min_temperature) / top.range() * 100.0
        } else {
            soc
        }
    }
}

#[derive(Debug, Default)]
pub struct ThermalStorage {
    storage: Option<Storage>,
    /// °C per layer, top to bottom
    temperatures: Vec<f64>,
}

impl ThermalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn storage(&self) -> Result<&Storage, ComponentError> {
        self.storage
            .as_ref()
            .ok_or_else(|| ComponentError::Calculation("thermal storage is not prepared".into()))
    }

    fn state_of_charge(&self) -> Result<f64, ComponentError> {
        let storage = self.storage()?;
        if self.temperatures.len() != storage.layers.len() {
            let missing = storage.layers[self.temperatures.len()..]
                .iter()
                .map(|l| temperature_port(l.sensor))
                .collect();
            return Err(ComponentError::MissingInput(missing));
        }
        Ok(storage.state_of_charge(&self.temperatures))
    }
}

impl Component for ThermalStorage {
    fn prepare(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
        let volume = number(static_data, VOLUME, Unit::CubicMetre)?;
        if volume <= 0.0 {
            return Err(invalid(VOLUME, "storage volume must be positive"));
        }

        let medium = match static_data.get(MEDIUM) {
            Some(entry) => entry
                .value
                .as_str()
                .and_then(Medium::parse)
                .ok_or_else(|| invalid(MEDIUM, format!("unknown medium {}", entry.value)))?,
            None => Medium::default(),
        };

        let reference_temperature = if static_data.contains(REFERENCE_TEMPERATURE) {
            Some(number(static_data, REFERENCE_TEMPERATURE, Unit::Celsius)?)
        } else {
            None
        };

        self.storage = Some(Storage {
            layers: layers(static_data, volume)?,
            volume,
            medium,
            reference_temperature,
        });
        self.temperatures.clear();
        Ok(())
    }

    fn set_input_values(&mut self, inputs: &ComponentData) -> Result<(), ComponentError> {
        let storage = self.storage()?;
        let temperatures = storage
            .layers
            .iter()
            .map(|layer| number(inputs, &temperature_port(layer.sensor), Unit::Celsius))
            .collect::<Result<Vec<_>, _>>()?;
        self.temperatures = temperatures;
        Ok(())
    }

    fn calculate(&mut self, output: &str) -> Result<Value, ComponentError> {
        let value = match output {
            STATE_OF_CHARGE => self.state_of_charge()?,
            ENERGY_CONTENT => self.state_of_charge()? / 100.0 * self.storage()?.nominal_energy(),
            NOMINAL_ENERGY => self.storage()?.nominal_energy(),
            ENERGY_MINIMUM => self.storage()?.energy_minimum(),
            ENERGY_MAXIMUM => self.storage()?.energy_maximum(),
            other => return Err(ComponentError::UnknownOutput(other.to_string())),
        };
        Ok(Value::Float(round2(value)))
    }

    fn output_unit(&self, output: &str) -> Option<Unit> {
        match output {
            STATE_OF_CHARGE => Some(Unit::Percent),
            ENERGY_CONTENT | NOMINAL_ENERGY | ENERGY_MINIMUM | ENERGY_MAXIMUM => Some(Unit::WattHour),
            _ => None,
        }
    }
}

/// Layers for every sensor with a configured height, split at the
/// midpoints between neighbouring sensors
fn layers(static_data: &ComponentData, volume: f64) -> Result<Vec<Layer>, ComponentError> {
    let mut sensors = Vec::new();
    for sensor in 1..=MAX_SENSORS {
        let height = height_port(sensor);
        if sensor > MIN_SENSORS && !static_data.contains(&height) {
            continue;
        }
        let min = number(static_data, &min_temperature_port(sensor), Unit::Celsius)?;
        let max = number(static_data, &max_temperature_port(sensor), Unit::Celsius)?;
        if max <= min {
            return Err(invalid(&max_temperature_port(sensor), "must exceed the minimum temperature"));
        }
        sensors.push((sensor, number(static_data, &height, Unit::Percent)?, min, max));
    }

    let heights: Vec<f64> = sensors.iter().map(|s| s.1).collect();
    if heights.iter().any(|h| !(0.0..=100.0).contains(h)) || heights.windows(2).any(|w| w[0] >= w[1]) {
        return Err(invalid(
            &height_port(1),
            "sensor heights must rise from the top sensor down, within 0 to 100",
        ));
    }

    let mut upper = 0.0;
    let layers = sensors
        .iter()
        .enumerate()
        .map(|(i, &(sensor, height, min_temperature, max_temperature))| {
            let lower = heights.get(i + 1).map_or(100.0, |next| (height + next) / 2.0);
            let layer = Layer {
                sensor,
                volume: (lower - upper) / 100.0 * volume,
                min_temperature,
                max_temperature,
            };
            upper = lower;
            layer
        })
        .collect();
    Ok(layers)
}

/// Required number whose unit, when given, must be `unit`
fn number(data: &ComponentData, key: &str, unit: Unit) -> Result<f64, ComponentError> {
    let value = data.require_f64(key)?;
    match data.require(key)?.unit {
        Some(found) if found != unit => Err(ComponentError::UnitMismatch {
            key: key.to_string(),
            expected: unit.to_string(),
            found: found.to_string(),
        }),
        _ => Ok(value),
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ComponentError {
    ComponentError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
