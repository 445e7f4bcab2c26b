// Two-Point Controller - Hysteresis switching on a single measured value
//
// Switches on below `setpoint - hysteresis`, off above `setpoint`, and in
// between keeps the previous command when it was "on".

use meridian_runtime::{Component, ComponentData, ComponentError, ComponentSchema, ComponentValue, PortSpec};
use meridian_types::{Unit, Value};

pub const TYPE_TAG: &str = "two_point_controller";

pub const CURRENT_VALUE: &str = "current_value";
pub const LATEST_CONTROL_SIGNAL: &str = "latest_control_signal";
pub const CONTROL_SIGNAL: &str = "control_signal";
pub const SETPOINT: &str = "setpoint";
pub const HYSTERESIS: &str = "hysteresis";
pub const COMMAND_ENABLED: &str = "command_enabled";
pub const COMMAND_DISABLED: &str = "command_disabled";

pub fn schema() -> ComponentSchema {
    ComponentSchema::new()
        .input(PortSpec::required(CURRENT_VALUE))
        .input(PortSpec::required(LATEST_CONTROL_SIGNAL))
        .output(PortSpec::required(CONTROL_SIGNAL))
        .static_port(PortSpec::required(SETPOINT))
        .static_port(PortSpec::required(HYSTERESIS))
        .static_port(PortSpec::optional(COMMAND_ENABLED))
        .static_port(PortSpec::optional(COMMAND_DISABLED))
}

#[derive(Debug, Clone, PartialEq)]
struct Quantity {
    value: f64,
    unit: Option<Unit>,
}

#[derive(Debug, Clone, PartialEq)]
struct Command {
    value: Value,
    unit: Option<Unit>,
}

#[derive(Debug, Clone, PartialEq)]
struct Parameters {
    setpoint: Quantity,
    hysteresis: Quantity,
    enabled: Command,
    disabled: Command,
}

#[derive(Debug, Clone, PartialEq)]
struct Inputs {
    current: Quantity,
    latest: Command,
}

#[derive(Debug, Default)]
pub struct TwoPointController {
    parameters: Option<Parameters>,
    inputs: Option<Inputs>,
    /// Unit of the command chosen by the last calculation
    signal_unit: Option<Unit>,
}

impl TwoPointController {
    pub fn new() -> Self {
        Self::default()
    }

    fn control_signal(&self) -> Result<Command, ComponentError> {
        let params = self
            .parameters
            .as_ref()
            .ok_or_else(|| ComponentError::Calculation("controller is not prepared".into()))?;
        let inputs = self
            .inputs
            .as_ref()
            .ok_or_else(|| ComponentError::MissingInput(vec![CURRENT_VALUE.to_string()]))?;

        ensure_same_unit(HYSTERESIS, params.setpoint.unit, params.hysteresis.unit)?;
        ensure_same_unit(CURRENT_VALUE, params.setpoint.unit, inputs.current.unit)?;
        ensure_same_unit(LATEST_CONTROL_SIGNAL, params.enabled.unit, inputs.latest.unit)?;
        ensure_same_unit(LATEST_CONTROL_SIGNAL, params.disabled.unit, inputs.latest.unit)?;

        let current = inputs.current.value;
        let lower = params.setpoint.value - params.hysteresis.value;

        let command = if current < lower {
            &params.enabled
        } else if current > params.setpoint.value {
            &params.disabled
        } else if same_command(&inputs.latest.value, &params.enabled.value) && current > lower {
            &params.enabled
        } else {
            &params.disabled
        };
        Ok(command.clone())
    }
}

impl Component for TwoPointController {
    fn prepare(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
        let command = |key: &str, fallback: i64| match static_data.get(key) {
            Some(entry) => Command {
                value: entry.value.clone(),
                unit: entry.unit,
            },
            None => Command {
                value: Value::Int(fallback),
                unit: None,
            },
        };

        self.parameters = Some(Parameters {
            setpoint: quantity(static_data, SETPOINT)?,
            hysteresis: quantity(static_data, HYSTERESIS)?,
            enabled: command(COMMAND_ENABLED, 1),
            disabled: command(COMMAND_DISABLED, 0),
        });
        Ok(())
    }

    fn set_input_values(&mut self, inputs: &ComponentData) -> Result<(), ComponentError> {
        let latest = inputs.require(LATEST_CONTROL_SIGNAL)?;
        self.inputs = Some(Inputs {
            current: quantity(inputs, CURRENT_VALUE)?,
            latest: Command {
                value: latest.value.clone(),
                unit: latest.unit,
            },
        });
        Ok(())
    }

    fn calculate(&mut self, output: &str) -> Result<Value, ComponentError> {
        match output {
            CONTROL_SIGNAL => {
                let command = self.control_signal()?;
                self.signal_unit = command.unit;
                Ok(command.value)
            }
            other => Err(ComponentError::UnknownOutput(other.to_string())),
        }
    }

    fn output_unit(&self, output: &str) -> Option<Unit> {
        match output {
            CONTROL_SIGNAL => self.signal_unit,
            _ => None,
        }
    }
}

fn quantity(data: &ComponentData, key: &str) -> Result<Quantity, ComponentError> {
    let ComponentValue { unit, .. } = data.require(key)?;
    Ok(Quantity {
        value: data.require_f64(key)?,
        unit: *unit,
    })
}

fn ensure_same_unit(key: &str, expected: Option<Unit>, found: Option<Unit>) -> Result<(), ComponentError> {
    if expected == found {
        return Ok(());
    }
    let name = |unit: Option<Unit>| unit.map_or_else(|| "none".to_string(), |u| u.to_string());
    Err(ComponentError::UnitMismatch {
        key: key.to_string(),
        expected: name(expected),
        found: name(found),
    })
}

/// Numeric commands compare by value so `1` and `1.0` are the same command
fn same_command(a: &Value, b: &Value) -> bool {
    match (a.is_numeric() && b.is_numeric(), a.as_f64(), b.as_f64()) {
        (true, Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
