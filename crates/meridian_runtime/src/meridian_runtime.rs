//! Meridian Runtime - Orchestration core
//!
//! Resolves a configuration into an allocation table, assembles input
//! data through interface adapters, runs pluggable components and writes
//! their results back. The [`CycleRunner`] ties these steps together; the
//! [`service`] module runs it on a schedule.

pub use meridian_types;

pub mod adapter;
pub mod allocation;
pub mod assembly;
pub mod component;
pub mod config;
pub mod cycle;
pub mod dispatch;
pub mod error;
pub mod service;

pub use adapter::{AdapterCall, AdapterSet, InterfaceAdapter, MemoryAdapter, PointWrite};
pub use allocation::{AllocationTable, ComponentBinding, ReadPlan, ResolvedPoint, Section, resolve};
pub use assembly::{Assembly, InputAssembler, ReadFailure};
pub use component::{
    Component, ComponentData, ComponentManager, ComponentOutcome, ComponentRegistry,
    ComponentSchema, ComponentStatus, ComponentValue, LifecycleState, PortSpec, ProducedOutput,
};
pub use config::{
    ComponentConfig, ConfigModel, ControllerSettings, CycleTiming, InterfaceSet, IoAllocation,
    ReadMode, Schedule,
};
pub use cycle::{CalculationHook, CycleReport, CycleRunner, CycleStatus, NoCalculation};
pub use dispatch::{OutputDispatcher, WriteOutcome, WriteStatus};
pub use error::{AdapterError, ComponentError, ConfigError, LifecycleError};
