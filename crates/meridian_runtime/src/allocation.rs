//! IO Allocation Resolver
//!
//! Turns the declared inputs, outputs and static data (top-level and per
//! component) into concrete points: address, unit, default and how the
//! point is read. Resolution runs once at startup and fails fast; the
//! resulting [`AllocationTable`] is immutable and shared across cycles.
//!
//! Top-level points keep their key. Component points are keyed
//! `<component_id>/<local_key>`.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use meridian_types::{InterfaceKind, PointAddress, Unit, Value};

use crate::component::{ComponentRegistry, ComponentSchema, PortSpec};
use crate::config::{
    ComponentConfig, ConfigModel, ConstantPoint, ControllerSettings, InterfaceSet, IoAllocation,
    ReadMode, Schedule,
};
use crate::error::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Resolved Types
// ─────────────────────────────────────────────────────────────────────────────

/// Which declaration block a point came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Input,
    Output,
    Static,
}

impl Section {
    pub fn label(&self) -> &'static str {
        match self {
            Section::Input => "input",
            Section::Output => "output",
            Section::Static => "static data",
        }
    }
}

/// How an input is obtained each cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPlan {
    /// Read from its interface
    Live(ReadMode),
    /// Served from the last value written to the named output
    LastOutput { output_key: String },
}

/// A fully resolved input, output or static point
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPoint {
    /// Table key, unique within its section
    pub key: String,
    /// Key as written in the declaring block
    pub local_key: String,
    /// Declaring component, `None` for top-level points
    pub owner: Option<String>,
    pub section: Section,
    pub address: PointAddress,
    pub unit: Option<Unit>,
    pub default: Option<Value>,
    pub plan: ReadPlan,
}

impl ResolvedPoint {
    pub fn read_mode(&self) -> Option<ReadMode> {
        match &self.plan {
            ReadPlan::Live(mode) => Some(*mode),
            ReadPlan::LastOutput { .. } => None,
        }
    }

    fn to_allocation(&self) -> IoAllocation {
        IoAllocation {
            entity: self.address.entity.clone(),
            attribute: self.address.attribute.clone(),
            interface: Some(self.address.interface),
            unit: self.unit.map(|u| u.code().to_string()),
            default: self.default.clone(),
            read_mode: self.read_mode(),
            attribute_interface: self.address.attribute_interface.clone(),
        }
    }
}

/// A `config` constant with its unit parsed
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConstant {
    pub value: Value,
    pub unit: Option<Unit>,
}

/// Maps a component's local port names to table keys
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentBinding {
    pub id: String,
    pub component_type: String,
    pub active: bool,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub static_data: BTreeMap<String, String>,
    pub constants: BTreeMap<String, ResolvedConstant>,
}

/// Result of resolving a configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationTable {
    pub name: String,
    pub interfaces: InterfaceSet,
    pub settings: ControllerSettings,
    pub schedule: Schedule,
    inputs: Vec<ResolvedPoint>,
    outputs: Vec<ResolvedPoint>,
    static_data: Vec<ResolvedPoint>,
    components: Vec<ComponentBinding>,
}

impl AllocationTable {
    pub fn inputs(&self) -> &[ResolvedPoint] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ResolvedPoint] {
        &self.outputs
    }

    pub fn static_data(&self) -> &[ResolvedPoint] {
        &self.static_data
    }

    /// Component bindings in configuration order
    pub fn components(&self) -> &[ComponentBinding] {
        &self.components
    }

    pub fn component(&self, id: &str) -> Option<&ComponentBinding> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn section(&self, section: Section) -> &[ResolvedPoint] {
        match section {
            Section::Input => &self.inputs,
            Section::Output => &self.outputs,
            Section::Static => &self.static_data,
        }
    }

    pub fn get(&self, section: Section, key: &str) -> Option<&ResolvedPoint> {
        self.section(section).iter().find(|p| p.key == key)
    }

    /// Total number of resolved points
    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len() + self.static_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the owner of a point takes part in cycles
    pub fn is_active(&self, point: &ResolvedPoint) -> bool {
        match &point.owner {
            None => true,
            Some(id) => self.component(id).map(|c| c.active).unwrap_or(false),
        }
    }

    /// Output points matching an entity attribute, optionally on one interface
    pub fn find_outputs(
        &self,
        entity: &str,
        attribute: &str,
        interface: Option<InterfaceKind>,
    ) -> Vec<&ResolvedPoint> {
        self.outputs
            .iter()
            .filter(|p| p.address.entity == entity && p.address.attribute == attribute)
            .filter(|p| interface.is_none_or(|i| p.address.interface == i))
            .collect()
    }

    /// Render the table back as a configuration with every field explicit
    pub fn to_config(&self) -> ConfigModel {
        let top_level = |points: &[ResolvedPoint]| -> BTreeMap<String, IoAllocation> {
            points
                .iter()
                .filter(|p| p.owner.is_none())
                .map(|p| (p.key.clone(), p.to_allocation()))
                .collect()
        };
        let owned_by = |points: &[ResolvedPoint], id: &str| -> BTreeMap<String, IoAllocation> {
            points
                .iter()
                .filter(|p| p.owner.as_deref() == Some(id))
                .map(|p| (p.local_key.clone(), p.to_allocation()))
                .collect()
        };

        let controller_components = self
            .components
            .iter()
            .map(|c| ComponentConfig {
                id: c.id.clone(),
                component_type: c.component_type.clone(),
                active: c.active,
                inputs: owned_by(&self.inputs, &c.id),
                outputs: owned_by(&self.outputs, &c.id),
                static_data: owned_by(&self.static_data, &c.id),
                config: c
                    .constants
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            ConstantPoint {
                                value: v.value.clone(),
                                unit: v.unit.map(|u| u.code().to_string()),
                            },
                        )
                    })
                    .collect(),
            })
            .collect();

        ConfigModel {
            name: self.name.clone(),
            interfaces: self.interfaces,
            inputs: top_level(&self.inputs),
            outputs: top_level(&self.outputs),
            static_data: top_level(&self.static_data),
            controller_components,
            controller_settings: self.settings.clone(),
        }
    }
}

/// Key of a component-owned point in the table
pub fn scoped_key(component_id: &str, local_key: &str) -> String {
    format!("{component_id}/{local_key}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve and validate a configuration against the registered component types
pub fn resolve(config: &ConfigModel, registry: &ComponentRegistry) -> Result<AllocationTable, ConfigError> {
    let schedule = config.controller_settings.schedule()?;
    let mut resolver = Resolver::new(config.interfaces);

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut static_data = Vec::new();

    for (key, alloc) in &config.inputs {
        inputs.push(resolver.point(Section::Input, key, None, alloc)?);
    }
    for (key, alloc) in &config.outputs {
        outputs.push(resolver.point(Section::Output, key, None, alloc)?);
    }
    for (key, alloc) in &config.static_data {
        static_data.push(resolver.point(Section::Static, key, None, alloc)?);
    }
    check_output_conflicts(&outputs)?;

    // Component ids and types first, so every later error names a known component
    let mut seen_ids = HashSet::new();
    let mut schemas = Vec::with_capacity(config.controller_components.len());
    for component in &config.controller_components {
        if !seen_ids.insert(component.id.as_str()) {
            return Err(ConfigError::DuplicateComponentId(component.id.clone()));
        }
        let schema = registry.schema(&component.component_type).ok_or_else(|| {
            ConfigError::UnknownComponentType {
                id: component.id.clone(),
                component_type: component.component_type.clone(),
            }
        })?;
        check_ports(component, schema)?;
        schemas.push(schema);
    }

    // Component outputs before component inputs so inputs can refer to them
    let mut component_outputs = Vec::new();
    for component in &config.controller_components {
        for (local, alloc) in &component.outputs {
            let alloc = inherit(alloc, &config.outputs);
            component_outputs.push(resolver.point(Section::Output, local, Some(&component.id), &alloc)?);
        }
    }
    check_output_conflicts(&component_outputs)?;
    outputs.extend(component_outputs);

    let mut components = Vec::with_capacity(config.controller_components.len());
    for (component, schema) in config.controller_components.iter().zip(schemas) {
        for (local, alloc) in &component.inputs {
            // An input without an interface of its own may read back any output at its address
            let wanted = inherit(alloc, &config.inputs).interface;
            let readback = outputs.iter().find(|o| {
                o.address.entity == alloc.entity
                    && o.address.attribute == alloc.attribute
                    && wanted.is_none_or(|kind| kind == o.address.interface)
            });
            let point = match readback {
                Some(output) => resolver.last_output(local, &component.id, alloc, &config.inputs, output)?,
                None => {
                    let alloc = inherit(alloc, &config.inputs);
                    resolver.point(Section::Input, local, Some(&component.id), &alloc)?
                }
            };
            warn_unit_mismatch(&component.id, &schema.inputs, local, point.unit);
            inputs.push(point);
        }
        for (local, alloc) in &component.static_data {
            let alloc = inherit(alloc, &config.static_data);
            let point = resolver.point(Section::Static, local, Some(&component.id), &alloc)?;
            warn_unit_mismatch(&component.id, &schema.static_data, local, point.unit);
            static_data.push(point);
        }
        for (local, _) in &component.outputs {
            if let Some(point) = outputs.iter().find(|o| o.owner.as_deref() == Some(component.id.as_str()) && &o.local_key == local) {
                warn_unit_mismatch(&component.id, &schema.outputs, local, point.unit);
            }
        }

        components.push(binding(component, &inputs, &outputs, &static_data)?);
    }

    debug!(
        inputs = inputs.len(),
        outputs = outputs.len(),
        static_data = static_data.len(),
        components = components.len(),
        "Allocation table resolved"
    );

    Ok(AllocationTable {
        name: config.name.clone(),
        interfaces: config.interfaces,
        settings: config.controller_settings.clone(),
        schedule,
        inputs,
        outputs,
        static_data,
        components,
    })
}

/// Inherit unset fields from the top-level declaration of the same point
fn inherit(alloc: &IoAllocation, top_level: &BTreeMap<String, IoAllocation>) -> IoAllocation {
    match top_level.values().find(|t| t.same_point(alloc)) {
        Some(parent) => alloc.inherit_from(parent),
        None => alloc.clone(),
    }
}

struct Resolver {
    interfaces: InterfaceSet,
    enabled: Vec<InterfaceKind>,
    keys: HashSet<(Section, String)>,
}

impl Resolver {
    fn new(interfaces: InterfaceSet) -> Self {
        Self {
            interfaces,
            enabled: interfaces.enabled(),
            keys: HashSet::new(),
        }
    }

    fn claim_key(&mut self, section: Section, key: &str) -> Result<(), ConfigError> {
        if !self.keys.insert((section, key.to_string())) {
            return Err(ConfigError::DuplicateKey(key.to_string()));
        }
        Ok(())
    }

    fn interface(&self, key: &str, explicit: Option<InterfaceKind>) -> Result<InterfaceKind, ConfigError> {
        match explicit {
            Some(kind) if self.interfaces.is_enabled(kind) => Ok(kind),
            Some(kind) => Err(ConfigError::InterfaceNotEnabled {
                key: key.to_string(),
                interface: kind,
            }),
            None => match self.enabled.as_slice() {
                [] => Err(ConfigError::NoInterfaceEnabled { key: key.to_string() }),
                [only] => Ok(*only),
                many => Err(ConfigError::AmbiguousInterface {
                    key: key.to_string(),
                    enabled: many.len(),
                }),
            },
        }
    }

    fn unit_and_default(&self, key: &str, alloc: &IoAllocation) -> Result<(Option<Unit>, Option<Value>), ConfigError> {
        let unit = parse_unit(key, alloc.unit.as_deref())?;
        if let (Some(unit), Some(default)) = (unit, &alloc.default) {
            if !unit.is_compatible(default) {
                return Err(ConfigError::IncompatibleDefault {
                    key: key.to_string(),
                    unit: unit.code().to_string(),
                    found: default.kind_name(),
                });
            }
        }
        Ok((unit, alloc.default.clone()))
    }

    fn point(
        &mut self,
        section: Section,
        local: &str,
        owner: Option<&str>,
        alloc: &IoAllocation,
    ) -> Result<ResolvedPoint, ConfigError> {
        let key = match owner {
            Some(id) => scoped_key(id, local),
            None => local.to_string(),
        };
        self.claim_key(section, &key)?;

        let interface = self.interface(&key, alloc.interface)?;
        let (unit, default) = self.unit_and_default(&key, alloc)?;

        let mut address = PointAddress::new(&alloc.entity, &alloc.attribute, interface);
        address.attribute_interface = alloc.attribute_interface.clone();

        Ok(ResolvedPoint {
            key,
            local_key: local.to_string(),
            owner: owner.map(String::from),
            section,
            address,
            unit,
            default,
            plan: ReadPlan::Live(alloc.read_mode.unwrap_or_default()),
        })
    }

    /// A component input that reads back a declared output
    fn last_output(
        &mut self,
        local: &str,
        owner: &str,
        alloc: &IoAllocation,
        top_inputs: &BTreeMap<String, IoAllocation>,
        output: &ResolvedPoint,
    ) -> Result<ResolvedPoint, ConfigError> {
        let key = scoped_key(owner, local);
        self.claim_key(Section::Input, &key)?;

        let alloc = inherit(alloc, top_inputs);
        let (unit, default) = self.unit_and_default(&key, &alloc)?;

        Ok(ResolvedPoint {
            key,
            local_key: local.to_string(),
            owner: Some(owner.to_string()),
            section: Section::Input,
            address: output.address.clone(),
            unit: unit.or(output.unit),
            default,
            plan: ReadPlan::LastOutput {
                output_key: output.key.clone(),
            },
        })
    }
}

fn parse_unit(key: &str, unit: Option<&str>) -> Result<Option<Unit>, ConfigError> {
    unit.map(|u| {
        u.parse::<Unit>().map_err(|_| ConfigError::UnknownUnit {
            key: key.to_string(),
            unit: u.to_string(),
        })
    })
    .transpose()
}

fn check_output_conflicts(outputs: &[ResolvedPoint]) -> Result<(), ConfigError> {
    let mut seen: HashMap<(&str, &str, InterfaceKind), &str> = HashMap::new();
    for point in outputs {
        let triple = (
            point.address.entity.as_str(),
            point.address.attribute.as_str(),
            point.address.interface,
        );
        if let Some(first) = seen.insert(triple, &point.key) {
            return Err(ConfigError::AmbiguousOutput {
                first: first.to_string(),
                second: point.key.clone(),
                address: point.address.to_string(),
            });
        }
    }
    Ok(())
}

fn check_ports(component: &ComponentConfig, schema: &ComponentSchema) -> Result<(), ConfigError> {
    let missing = |section: &'static str, port: &PortSpec| ConfigError::MissingPort {
        id: component.id.clone(),
        section,
        port: port.name.clone(),
    };

    for port in schema.inputs.iter().filter(|p| p.required) {
        if !component.inputs.contains_key(&port.name) {
            return Err(missing("input", port));
        }
    }
    for port in schema.outputs.iter().filter(|p| p.required) {
        if !component.outputs.contains_key(&port.name) {
            return Err(missing("output", port));
        }
    }
    for port in schema.static_data.iter().filter(|p| p.required) {
        if !component.static_data.contains_key(&port.name) && !component.config.contains_key(&port.name) {
            return Err(missing("static data", port));
        }
    }

    let known = |ports: &[PortSpec], name: &str| ports.iter().any(|p| p.name == name);
    for name in component.inputs.keys() {
        if !known(&schema.inputs, name) {
            warn!(component_id = %component.id, port = %name, "Unknown input port");
        }
    }
    for name in component.outputs.keys() {
        if !known(&schema.outputs, name) {
            warn!(component_id = %component.id, port = %name, "Unknown output port");
        }
    }
    for name in component.static_data.keys().chain(component.config.keys()) {
        if !known(&schema.static_data, name) {
            warn!(component_id = %component.id, port = %name, "Unknown static data port");
        }
    }
    Ok(())
}

fn warn_unit_mismatch(component_id: &str, ports: &[PortSpec], local: &str, declared: Option<Unit>) {
    let expected = ports.iter().find(|p| p.name == local).and_then(|p| p.unit);
    if let (Some(expected), Some(declared)) = (expected, declared) {
        if expected != declared {
            warn!(
                component_id,
                port = local,
                expected = %expected,
                declared = %declared,
                "Declared unit differs from the component's expected unit; values are passed unconverted"
            );
        }
    }
}

fn binding(
    component: &ComponentConfig,
    inputs: &[ResolvedPoint],
    outputs: &[ResolvedPoint],
    static_data: &[ResolvedPoint],
) -> Result<ComponentBinding, ConfigError> {
    let owned = |points: &[ResolvedPoint]| -> BTreeMap<String, String> {
        points
            .iter()
            .filter(|p| p.owner.as_deref() == Some(component.id.as_str()))
            .map(|p| (p.local_key.clone(), p.key.clone()))
            .collect()
    };

    let mut constants = BTreeMap::new();
    for (name, constant) in &component.config {
        let key = scoped_key(&component.id, name);
        let unit = parse_unit(&key, constant.unit.as_deref())?;
        constants.insert(
            name.clone(),
            ResolvedConstant {
                value: constant.value.clone(),
                unit,
            },
        );
    }

    Ok(ComponentBinding {
        id: component.id.clone(),
        component_type: component.component_type.clone(),
        active: component.active,
        inputs: owned(inputs),
        outputs: owned(outputs),
        static_data: owned(static_data),
        constants,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
