//! Interface Adapter Contract
//!
//! Every transport (context-state API, time-series database, MQTT, file)
//! implements [`InterfaceAdapter`]. The core only ever talks to this trait
//! and picks the instance by the interface tag of the point it is reading
//! or writing.

mod memory;

pub use memory::*;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;

use meridian_types::{InterfaceKind, PointAddress, Reading, Unit, Value};

use crate::config::InterfaceSet;
use crate::error::{AdapterError, ConfigError};

/// One value bound for an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct PointWrite {
    pub address: PointAddress,
    pub value: Value,
    pub unit: Option<Unit>,
    pub timestamp: DateTime<Utc>,
}

/// Capability set of a concrete transport
#[async_trait]
pub trait InterfaceAdapter: Send + Sync + 'static {
    /// Interface this adapter serves
    fn kind(&self) -> InterfaceKind;

    /// Current value of one attribute
    async fn fetch_current(&self, address: &PointAddress) -> Result<Reading, AdapterError>;

    /// Readings with `start <= time <= end`, oldest first
    async fn fetch_range(
        &self,
        address: &PointAddress,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, AdapterError>;

    /// Write one value
    async fn write_value(
        &self,
        address: &PointAddress,
        value: &Value,
        unit: Option<Unit>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AdapterError>;

    /// Write a batch of values, returning one result per write in order.
    /// Adapters that persist a whole document override this to save once.
    async fn write_batch(&self, writes: &[PointWrite]) -> Vec<Result<(), AdapterError>> {
        join_all(
            writes
                .iter()
                .map(|w| self.write_value(&w.address, &w.value, w.unit, w.timestamp)),
        )
        .await
    }
}

/// Adapter instances keyed by interface
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<InterfaceKind, Arc<dyn InterfaceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter under its own kind, replacing any previous one
    pub fn insert(&mut self, adapter: Arc<dyn InterfaceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn InterfaceAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn get(&self, kind: InterfaceKind) -> Result<&Arc<dyn InterfaceAdapter>, AdapterError> {
        self.adapters.get(&kind).ok_or(AdapterError::NoAdapter(kind))
    }

    pub fn contains(&self, kind: InterfaceKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    /// Every enabled interface must have an adapter
    pub fn ensure_covers(&self, interfaces: &InterfaceSet) -> Result<(), ConfigError> {
        match interfaces.enabled().into_iter().find(|k| !self.contains(*k)) {
            Some(kind) => Err(ConfigError::UnsupportedInterface(kind)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("AdapterSet").field("interfaces", &kinds).finish()
    }
}
