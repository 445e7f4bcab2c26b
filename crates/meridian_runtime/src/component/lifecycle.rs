//! Component Lifecycle Manager
//!
//! Owns every configured component instance and drives it through
//!
//! ```text
//! Unconstructed -> Constructed -> Prepared -> Ready <-> Running
//!                                             Ready <-> Calibrating
//! ```
//!
//! Components run one after another in configuration order. Only outputs
//! written in earlier cycles are visible to a component, so a single pass
//! with no dependency ordering is enough.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use meridian_types::{DataTransferModel, InputDataModel, InputPoint, ResultPoint, Unit, Value};

use super::{Component, ComponentData, ComponentRegistry, ComponentValue};
use crate::allocation::{AllocationTable, ComponentBinding, Section};
use crate::error::{ComponentError, ConfigError, LifecycleError};

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unconstructed,
    Constructed,
    Prepared,
    Ready,
    Running,
    Calibrating,
}

impl LifecycleState {
    /// Whether `self -> to` is a legal move
    pub fn can_move_to(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Unconstructed, Constructed)
                | (Constructed, Prepared)
                | (Prepared, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Ready, Calibrating)
                | (Calibrating, Ready)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unconstructed => "unconstructed",
            LifecycleState::Constructed => "constructed",
            LifecycleState::Prepared => "prepared",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Calibrating => "calibrating",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ComponentStatus {
    Succeeded { outputs: usize },
    Failed { reason: String },
    /// Inactive in the configuration
    Skipped,
}

/// What happened to one component in one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentOutcome {
    pub component_id: String,
    #[serde(flatten)]
    pub status: ComponentStatus,
}

impl ComponentOutcome {
    fn succeeded(id: &str, outputs: usize) -> Self {
        Self {
            component_id: id.to_string(),
            status: ComponentStatus::Succeeded { outputs },
        }
    }

    fn failed(id: &str, error: &ComponentError) -> Self {
        Self {
            component_id: id.to_string(),
            status: ComponentStatus::Failed {
                reason: error.to_string(),
            },
        }
    }

    fn skipped(id: &str) -> Self {
        Self {
            component_id: id.to_string(),
            status: ComponentStatus::Skipped,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ComponentStatus::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, ComponentStatus::Failed { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Managed Component
// ─────────────────────────────────────────────────────────────────────────────

/// One output value keyed by its allocation table key
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedOutput {
    pub key: String,
    pub value: Value,
    pub unit: Option<Unit>,
}

/// A component instance together with its binding and state
pub struct ManagedComponent {
    binding: ComponentBinding,
    /// Input ports the schema marks as required
    required_inputs: Vec<String>,
    state: LifecycleState,
    instance: Box<dyn Component>,
}

impl ManagedComponent {
    /// Construct the component configured under `component_id`
    ///
    /// Fails with [`ConfigError::UnknownComponent`] if the id has no
    /// configuration; nothing is built in that case.
    pub fn construct(
        table: &AllocationTable,
        registry: &ComponentRegistry,
        component_id: &str,
    ) -> Result<Self, ConfigError> {
        let binding = table
            .component(component_id)
            .ok_or_else(|| ConfigError::UnknownComponent(component_id.to_string()))?
            .clone();
        let instance = registry.create(&binding)?;
        let required_inputs = registry
            .schema(&binding.component_type)
            .map(|schema| {
                schema
                    .inputs
                    .iter()
                    .filter(|port| port.required)
                    .map(|port| port.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut component = Self {
            binding,
            required_inputs,
            state: LifecycleState::Unconstructed,
            instance,
        };
        component
            .transition(LifecycleState::Constructed)
            .map_err(|e| ConfigError::InvalidComponent {
                id: component_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(component)
    }

    pub fn id(&self) -> &str {
        &self.binding.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn binding(&self) -> &ComponentBinding {
        &self.binding
    }

    fn transition(&mut self, to: LifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_move_to(to) {
            return Err(LifecycleError::InvalidTransition {
                id: self.binding.id.clone(),
                from: self.state,
                to,
            });
        }
        debug!(component_id = %self.binding.id, from = %self.state, to = %to, "Component state change");
        self.state = to;
        Ok(())
    }

    /// Constructed -> Prepared -> Ready
    pub fn prepare(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
        self.transition(LifecycleState::Prepared)?;
        if let Err(e) = self.instance.prepare(static_data) {
            // stays retryable
            self.state = LifecycleState::Constructed;
            return Err(e);
        }
        self.transition(LifecycleState::Ready)?;
        Ok(())
    }

    /// Ready -> Running -> Ready, returning one value per declared output
    pub fn run(&mut self, inputs: &ComponentData) -> Result<Vec<ProducedOutput>, ComponentError> {
        self.transition(LifecycleState::Running)?;
        let result = self.run_outputs(inputs);
        self.transition(LifecycleState::Ready)?;
        result
    }

    fn run_outputs(&mut self, inputs: &ComponentData) -> Result<Vec<ProducedOutput>, ComponentError> {
        self.instance.set_input_values(inputs)?;
        let mut values = Vec::with_capacity(self.binding.outputs.len());
        for (local, table_key) in &self.binding.outputs {
            let value = self.instance.calculate(local)?;
            values.push(ProducedOutput {
                key: table_key.clone(),
                value,
                unit: self.instance.output_unit(local),
            });
        }
        Ok(values)
    }

    /// Ready -> Calibrating -> Ready
    pub fn calibrate(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
        self.transition(LifecycleState::Calibrating)?;
        let result = self.instance.calibrate(static_data);
        self.transition(LifecycleState::Ready)?;
        result
    }
}

impl fmt::Debug for ManagedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedComponent")
            .field("id", &self.binding.id)
            .field("type", &self.binding.component_type)
            .field("state", &self.state)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Runs all configured components over an assembled input bundle
pub struct ComponentManager {
    table: Arc<AllocationTable>,
    components: Vec<ManagedComponent>,
}

impl ComponentManager {
    /// Construct every component of the table, in configuration order
    pub fn construct(table: Arc<AllocationTable>, registry: &ComponentRegistry) -> Result<Self, ConfigError> {
        let components = table
            .components()
            .iter()
            .map(|binding| ManagedComponent::construct(&table, registry, &binding.id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { table, components })
    }

    pub fn components(&self) -> &[ManagedComponent] {
        &self.components
    }

    /// Number of components that take part in cycles
    pub fn active_count(&self) -> usize {
        self.components.iter().filter(|c| c.binding.active).count()
    }

    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.components.iter().find(|c| c.id() == id).map(|c| c.state)
    }

    /// Run a calculation pass
    ///
    /// A component whose inputs are missing, or whose calculation fails,
    /// contributes no outputs; the others are unaffected.
    pub fn run(&mut self, data: &InputDataModel) -> (Vec<ComponentOutcome>, DataTransferModel) {
        let mut outcomes = Vec::with_capacity(self.components.len());
        let mut results = DataTransferModel::new();

        for component in &mut self.components {
            let id = component.binding.id.clone();
            if !component.binding.active {
                outcomes.push(ComponentOutcome::skipped(&id));
                continue;
            }

            match run_one(&self.table, component, data) {
                Ok(points) => {
                    outcomes.push(ComponentOutcome::succeeded(&id, points.len()));
                    for point in points {
                        results.push(point);
                    }
                }
                Err(e) => {
                    warn!(component_id = %id, error = %e, "Component failed");
                    outcomes.push(ComponentOutcome::failed(&id, &e));
                }
            }
        }

        (outcomes, results)
    }

    /// Run a calibration pass, feeding every component fresh static data
    pub fn calibrate(&mut self, data: &InputDataModel) -> Vec<ComponentOutcome> {
        let mut outcomes = Vec::with_capacity(self.components.len());

        for component in &mut self.components {
            let id = component.binding.id.clone();
            if !component.binding.active {
                outcomes.push(ComponentOutcome::skipped(&id));
                continue;
            }

            let static_data = static_data_for(&component.binding, data);
            let result = match component.state {
                LifecycleState::Constructed => component.prepare(&static_data),
                _ => component.calibrate(&static_data),
            };
            match result {
                Ok(()) => outcomes.push(ComponentOutcome::succeeded(&id, 0)),
                Err(e) => {
                    warn!(component_id = %id, error = %e, "Component calibration failed");
                    outcomes.push(ComponentOutcome::failed(&id, &e));
                }
            }
        }

        outcomes
    }
}

impl fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentManager")
            .field("components", &self.components)
            .finish()
    }
}

fn run_one(
    table: &AllocationTable,
    component: &mut ManagedComponent,
    data: &InputDataModel,
) -> Result<Vec<ResultPoint>, ComponentError> {
    // Components that could not be prepared yet get another attempt
    if component.state == LifecycleState::Constructed {
        let static_data = static_data_for(&component.binding, data);
        component.prepare(&static_data)?;
    }

    let missing: Vec<String> = component
        .binding
        .inputs
        .iter()
        .filter(|(local, key)| {
            component.required_inputs.contains(local) && (data.is_missing(key) || data.input(key).is_none())
        })
        .map(|(local, _)| local.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ComponentError::MissingInput(missing));
    }

    let mut inputs = ComponentData::new();
    for (local, key) in &component.binding.inputs {
        if let Some(point) = data.input(key) {
            inputs.insert(local.clone(), component_value(point));
        }
    }

    let values = component.run(&inputs)?;
    let points = values
        .into_iter()
        .filter_map(|output| {
            let point = table.get(Section::Output, &output.key)?;
            let mut result = ResultPoint::new(&point.address.entity, &point.address.attribute, output.value)
                .on_interface(point.address.interface);
            // A configured unit wins over the one the component reports
            result.unit = point.unit.or(output.unit);
            let timestamp = result.governing_timestamp(data.timestamp);
            Some(result.with_timestamp(timestamp))
        })
        .collect();
    Ok(points)
}

/// Constants from `config`, overlaid by static data read from interfaces
fn static_data_for(binding: &ComponentBinding, data: &InputDataModel) -> ComponentData {
    let mut static_data = ComponentData::new();
    for (name, constant) in &binding.constants {
        static_data.insert(
            name.clone(),
            ComponentValue::new(constant.value.clone(), constant.unit),
        );
    }
    for (local, key) in &binding.static_data {
        if let Some(point) = data.static_point(key) {
            static_data.insert(local.clone(), component_value(point));
        }
    }
    static_data
}

fn component_value(point: &InputPoint) -> ComponentValue {
    ComponentValue {
        value: point.value.clone(),
        unit: point.unit,
        provenance: point.provenance,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::resolve;
    use crate::component::{ComponentSchema, PortSpec};
    use crate::config::{ComponentConfig, ConfigModel, ControllerSettings, CycleTiming, InterfaceSet, IoAllocation};
    use chrono::Utc;
    use meridian_types::{CycleKind, Granularity, InterfaceKind, PointAddress, Provenance};
    use std::collections::BTreeMap;

    /// Output = input * gain + bias; fails on negative input
    struct Gain {
        gain: f64,
        input: f64,
        bias: f64,
    }

    impl Component for Gain {
        fn prepare(&mut self, static_data: &ComponentData) -> Result<(), ComponentError> {
            self.gain = static_data.require_f64("gain")?;
            Ok(())
        }

        fn set_input_values(&mut self, inputs: &ComponentData) -> Result<(), ComponentError> {
            self.input = inputs.require_f64("x")?;
            self.bias = match inputs.get("bias") {
                Some(_) => inputs.require_f64("bias")?,
                None => 0.0,
            };
            Ok(())
        }

        fn calculate(&mut self, output: &str) -> Result<Value, ComponentError> {
            match output {
                "y" if self.input < 0.0 => Err(ComponentError::Calculation("negative input".into())),
                "y" => Ok(Value::Float(self.input * self.gain + self.bias)),
                other => Err(ComponentError::UnknownOutput(other.to_string())),
            }
        }

        fn output_unit(&self, _output: &str) -> Option<Unit> {
            Some(Unit::Kilowatt)
        }
    }

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register_fn(
            "gain",
            ComponentSchema::new()
                .input(PortSpec::required("x"))
                .input(PortSpec::optional("bias"))
                .output(PortSpec::required("y"))
                .static_port(PortSpec::required("gain")),
            |_| {
                Ok(Box::new(Gain {
                    gain: 0.0,
                    input: 0.0,
                    bias: 0.0,
                }))
            },
        );
        registry
    }

    fn gain_component(id: &str, source: &str, target: &str) -> ComponentConfig {
        ComponentConfig::new(id, "gain")
            .input("x", IoAllocation::new("plant", source))
            .output("y", IoAllocation::new("plant", target))
            .constant("gain", 2.0, None)
    }

    fn table(components: Vec<ComponentConfig>) -> Arc<AllocationTable> {
        let config = ConfigModel {
            name: "lifecycle".into(),
            interfaces: InterfaceSet::only(InterfaceKind::File),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            static_data: BTreeMap::new(),
            controller_components: components,
            controller_settings: ControllerSettings::new(CycleTiming::new(1, Granularity::Minute)),
        };
        Arc::new(resolve(&config, &registry()).unwrap())
    }

    fn bundle(values: &[(&str, f64)]) -> InputDataModel {
        let mut data = InputDataModel::new(CycleKind::Calculation, Utc::now());
        for (key, value) in values {
            data.inputs.push(InputPoint {
                key: key.to_string(),
                address: PointAddress::new("plant", *key, InterfaceKind::File),
                value: Value::Float(*value),
                unit: None,
                timestamp: data.timestamp,
                provenance: Provenance::Live,
            });
        }
        data
    }

    #[test]
    fn test_state_transitions() {
        use LifecycleState::*;
        assert!(Unconstructed.can_move_to(Constructed));
        assert!(Ready.can_move_to(Running));
        assert!(Running.can_move_to(Ready));
        assert!(Ready.can_move_to(Calibrating));
        assert!(!Running.can_move_to(Calibrating));
        assert!(!Constructed.can_move_to(Running));
    }

    #[test]
    fn test_construct_unknown_id_fails() {
        let table = table(vec![gain_component("a", "in_a", "out_a")]);
        let err = ManagedComponent::construct(&table, &registry(), "ghost").unwrap_err();
        assert_eq!(err, ConfigError::UnknownComponent("ghost".into()));
    }

    #[test]
    fn test_run_produces_outputs() {
        let table = table(vec![gain_component("a", "in_a", "out_a")]);
        let mut manager = ComponentManager::construct(table, &registry()).unwrap();
        assert_eq!(manager.state_of("a"), Some(LifecycleState::Constructed));

        let (outcomes, results) = manager.run(&bundle(&[("a/x", 4.0)]));

        assert_eq!(outcomes, vec![ComponentOutcome::succeeded("a", 1)]);
        assert_eq!(results.len(), 1);
        let point = &results.points[0];
        assert_eq!(point.entity, "plant");
        assert_eq!(point.attribute, "out_a");
        assert_eq!(point.value, Value::Float(8.0));
        assert_eq!(manager.state_of("a"), Some(LifecycleState::Ready));
    }

    #[test]
    fn test_missing_input_fails_only_owner() {
        let table = table(vec![
            gain_component("a", "in_a", "out_a"),
            gain_component("b", "in_b", "out_b"),
        ]);
        let mut manager = ComponentManager::construct(table, &registry()).unwrap();

        let mut data = bundle(&[("b/x", 1.5)]);
        data.missing.push("a/x".into());
        let (outcomes, results) = manager.run(&data);

        assert!(outcomes[0].is_failure());
        assert_eq!(outcomes[1], ComponentOutcome::succeeded("b", 1));
        assert_eq!(results.len(), 1);
        assert_eq!(results.points[0].attribute, "out_b");
    }

    #[test]
    fn test_output_unit_from_component_unless_configured() {
        let configured = ComponentConfig::new("b", "gain")
            .input("x", IoAllocation::new("plant", "in_b"))
            .output("y", IoAllocation::new("plant", "out_b").with_unit("WTT"))
            .constant("gain", 2.0, None);
        let table = table(vec![gain_component("a", "in_a", "out_a"), configured]);
        let mut manager = ComponentManager::construct(table, &registry()).unwrap();

        let (_, results) = manager.run(&bundle(&[("a/x", 1.0), ("b/x", 1.0)]));
        assert_eq!(results.points[0].unit, Some(Unit::Kilowatt));
        assert_eq!(results.points[1].unit, Some(Unit::Watt));
    }

    #[test]
    fn test_unreadable_optional_input_is_skipped() {
        let component = gain_component("a", "in_a", "out_a")
            .input("bias", IoAllocation::new("plant", "bias_a"));
        let mut manager = ComponentManager::construct(table(vec![component]), &registry()).unwrap();

        let mut data = bundle(&[("a/x", 4.0)]);
        data.missing.push("a/bias".into());
        let (outcomes, results) = manager.run(&data);
        assert_eq!(outcomes, vec![ComponentOutcome::succeeded("a", 1)]);
        assert_eq!(results.points[0].value, Value::Float(8.0));

        // The required port still gates the run
        let mut data = bundle(&[("a/bias", 1.0)]);
        data.missing.push("a/x".into());
        let (outcomes, _) = manager.run(&data);
        assert!(outcomes[0].is_failure());

        let (_, results) = manager.run(&bundle(&[("a/x", 4.0), ("a/bias", 1.0)]));
        assert_eq!(results.points[0].value, Value::Float(9.0));
    }

    #[test]
    fn test_failed_calculation_omits_outputs_and_returns_to_ready() {
        let table = table(vec![gain_component("a", "in_a", "out_a")]);
        let mut manager = ComponentManager::construct(table, &registry()).unwrap();

        let (outcomes, results) = manager.run(&bundle(&[("a/x", -1.0)]));
        assert!(outcomes[0].is_failure());
        assert!(results.is_empty());
        assert_eq!(manager.state_of("a"), Some(LifecycleState::Ready));

        let (outcomes, _) = manager.run(&bundle(&[("a/x", 1.0)]));
        assert!(outcomes[0].is_success());
    }

    #[test]
    fn test_inactive_component_skipped() {
        let mut inactive = gain_component("a", "in_a", "out_a");
        inactive.active = false;
        let table = table(vec![inactive]);
        let mut manager = ComponentManager::construct(table, &registry()).unwrap();

        assert_eq!(manager.active_count(), 0);
        let (outcomes, results) = manager.run(&bundle(&[("a/x", 1.0)]));
        assert_eq!(outcomes, vec![ComponentOutcome::skipped("a")]);
        assert!(results.is_empty());
    }

    #[test]
    fn test_calibrate_cycles_through_calibrating() {
        let table = table(vec![gain_component("a", "in_a", "out_a")]);
        let mut manager = ComponentManager::construct(table, &registry()).unwrap();

        let data = InputDataModel::new(CycleKind::Calibration, Utc::now());
        let outcomes = manager.calibrate(&data);
        assert!(outcomes[0].is_success());
        assert_eq!(manager.state_of("a"), Some(LifecycleState::Ready));

        let outcomes = manager.calibrate(&data);
        assert!(outcomes[0].is_success());
        assert_eq!(manager.state_of("a"), Some(LifecycleState::Ready));
    }
}
