// Moving Average - Mean of a range-read input over the cycle's window

use meridian_runtime::{Component, ComponentData, ComponentError, ComponentSchema, PortSpec};
use meridian_types::Value;

pub const TYPE_TAG: &str = "moving_average";

pub const INPUT: &str = "value";
pub const OUTPUT: &str = "average";
/// Fewest samples an average may be built from
pub const MIN_SAMPLES: &str = "min_samples";

pub fn schema() -> ComponentSchema {
    ComponentSchema::new()
        .input(PortSpec::required(INPUT))
        .output(PortSpec::required(OUTPUT))
        .static_port(PortSpec::optional(MIN_SAMPLES))
}

#[derive(Debug)]
pub struct MovingAverage {
    min_samples: usize,
    samples: Vec<f64>,
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self {
            min_samples: 1,
            samples: Vec::new(),
        }
    }
}

impl MovingAverage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Component for MovingAverage {
    fn prepare(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
        self.min_samples = match static_data.get(MIN_SAMPLES) {
            Some(entry) => match entry.value.as_i64() {
                Some(n) if n >= 1 => n as usize,
                _ => {
                    return Err(ComponentError::InvalidValue {
                        key: MIN_SAMPLES.to_string(),
                        reason: "expected a positive integer".into(),
                    });
                }
            },
            None => 1,
        };
        Ok(())
    }

    fn set_input_values(&mut self, inputs: &ComponentData) -> Result<(), ComponentError> {
        let entry = inputs.require(INPUT)?;
        self.samples = match &entry.value {
            Value::Series(series) => series.samples().iter().map(|s| s.value).collect(),
            Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
            scalar => vec![inputs.require_f64(INPUT).map_err(|_| ComponentError::InvalidValue {
                key: INPUT.to_string(),
                reason: format!("cannot average {}", scalar.kind_name()),
            })?],
        };
        Ok(())
    }

    fn calculate(&mut self, output: &str) -> Result<Value, ComponentError> {
        if output != OUTPUT {
            return Err(ComponentError::UnknownOutput(output.to_string()));
        }
        if self.samples.len() < self.min_samples {
            return Err(ComponentError::Calculation(format!(
                "{} samples in window, at least {} required",
                self.samples.len(),
                self.min_samples
            )));
        }
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        Ok(Value::Float(mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use meridian_types::{Sample, TimeSeries};

    fn series(values: &[f64]) -> TimeSeries {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(Utc.timestamp_opt(60 * i as i64, 0).unwrap(), *v))
            .collect()
    }

    #[test]
    fn test_average_of_series() {
        let mut average = MovingAverage::new();
        average.prepare(&ComponentData::new()).unwrap();
        average
            .set_input_values(&ComponentData::new().with(INPUT, series(&[1.0, 2.0, 6.0]), None))
            .unwrap();

        assert_eq!(average.calculate(OUTPUT).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_scalar_input_is_one_sample() {
        let mut average = MovingAverage::new();
        average.prepare(&ComponentData::new()).unwrap();
        average
            .set_input_values(&ComponentData::new().with(INPUT, 4.5, None))
            .unwrap();
        assert_eq!(average.calculate(OUTPUT).unwrap(), Value::Float(4.5));

        let text = ComponentData::new().with(INPUT, "n/a", None);
        assert!(matches!(
            average.set_input_values(&text),
            Err(ComponentError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_minimum_sample_count() {
        let mut average = MovingAverage::new();
        average
            .prepare(&ComponentData::new().with(MIN_SAMPLES, 3, None))
            .unwrap();
        average
            .set_input_values(&ComponentData::new().with(INPUT, series(&[1.0, 2.0]), None))
            .unwrap();
        assert!(matches!(average.calculate(OUTPUT), Err(ComponentError::Calculation(_))));

        let bad = ComponentData::new().with(MIN_SAMPLES, 0, None);
        assert!(average.prepare(&bad).is_err());
    }
}
