//! In-memory adapter
//!
//! Holds per-attribute histories in memory. Writes are appended to the same
//! history, so a written output is visible to the next `fetch_current`.
//! Reads and writes can be made to fail or stall, and every call is
//! recorded for inspection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use meridian_types::{InterfaceKind, PointAddress, Reading, Unit, Value};

use super::InterfaceAdapter;
use crate::error::AdapterError;

type PointKey = (String, String);

fn point_key(entity: &str, attribute: &str) -> PointKey {
    (entity.to_string(), attribute.to_string())
}

/// One recorded adapter call
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    FetchCurrent(PointAddress),
    FetchRange {
        address: PointAddress,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Write {
        address: PointAddress,
        value: Value,
        unit: Option<Unit>,
        timestamp: DateTime<Utc>,
    },
}

pub struct MemoryAdapter {
    kind: InterfaceKind,
    history: DashMap<PointKey, Vec<Reading>>,
    failing_reads: DashSet<PointKey>,
    failing_writes: DashSet<PointKey>,
    reject_writes: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    write_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<AdapterCall>>,
}

impl MemoryAdapter {
    pub fn new(kind: InterfaceKind) -> Self {
        Self {
            kind,
            history: DashMap::new(),
            failing_reads: DashSet::new(),
            failing_writes: DashSet::new(),
            reject_writes: AtomicBool::new(false),
            read_delay: Mutex::new(None),
            write_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Append a reading to an attribute's history
    pub fn push(&self, entity: &str, attribute: &str, reading: Reading) {
        let mut entry = self.history.entry(point_key(entity, attribute)).or_default();
        let at = entry.partition_point(|r| r.timestamp <= reading.timestamp);
        entry.insert(at, reading);
    }

    pub fn set(&self, entity: &str, attribute: &str, value: impl Into<Value>, timestamp: DateTime<Utc>) {
        self.push(entity, attribute, Reading::new(value, timestamp));
    }

    /// Newest reading of an attribute, including written values
    pub fn latest(&self, entity: &str, attribute: &str) -> Option<Reading> {
        self.history
            .get(&point_key(entity, attribute))
            .and_then(|h| h.last().cloned())
    }

    pub fn fail_reads(&self, entity: &str, attribute: &str) {
        self.failing_reads.insert(point_key(entity, attribute));
    }

    pub fn fail_writes(&self, entity: &str, attribute: &str) {
        self.failing_writes.insert(point_key(entity, attribute));
    }

    pub fn reject_all_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Stall every read by `delay`
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Stall every write by `delay`
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn current_reads(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, AdapterCall::FetchCurrent(_)))
            .count()
    }

    pub fn range_reads(&self) -> Vec<(PointAddress, DateTime<Utc>, DateTime<Utc>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AdapterCall::FetchRange { address, start, end } => Some((address.clone(), *start, *end)),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<(PointAddress, Value)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AdapterCall::Write { address, value, .. } => Some((address.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: AdapterCall) {
        self.calls.lock().push(call);
    }

    async fn before_read(&self, address: &PointAddress) -> Result<(), AdapterError> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_reads.contains(&point_key(&address.entity, &address.attribute)) {
            return Err(AdapterError::unavailable(address, "injected read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl InterfaceAdapter for MemoryAdapter {
    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    async fn fetch_current(&self, address: &PointAddress) -> Result<Reading, AdapterError> {
        self.record(AdapterCall::FetchCurrent(address.clone()));
        self.before_read(address).await?;
        self.latest(&address.entity, &address.attribute)
            .ok_or_else(|| AdapterError::unavailable(address, "no value stored"))
    }

    async fn fetch_range(
        &self,
        address: &PointAddress,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, AdapterError> {
        self.record(AdapterCall::FetchRange {
            address: address.clone(),
            start,
            end,
        });
        self.before_read(address).await?;
        let readings = self
            .history
            .get(&point_key(&address.entity, &address.attribute))
            .map(|h| {
                h.iter()
                    .filter(|r| r.timestamp >= start && r.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(readings)
    }

    async fn write_value(
        &self,
        address: &PointAddress,
        value: &Value,
        unit: Option<Unit>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AdapterError> {
        self.record(AdapterCall::Write {
            address: address.clone(),
            value: value.clone(),
            unit,
            timestamp,
        });
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let key = point_key(&address.entity, &address.attribute);
        if self.reject_writes.load(Ordering::SeqCst) || self.failing_writes.contains(&key) {
            return Err(AdapterError::rejected(address, "injected write failure"));
        }
        let mut reading = Reading::new(value.clone(), timestamp);
        reading.unit = unit;
        self.push(&address.entity, &address.attribute, reading);
        Ok(())
    }
}
