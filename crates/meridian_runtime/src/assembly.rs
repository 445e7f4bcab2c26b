//! Input Assembly Pipeline
//!
//! Builds the [`InputDataModel`] for one cycle. Every read is issued
//! concurrently and bounded by the cycle deadline. A failed read falls back
//! to the point's default (marked [`Provenance::Default`]) or, without a
//! default, is recorded as missing so only the owning component fails.
//!
//! Static data is read on calibration cycles and on the first cycle, then
//! served from a cache. Outputs are read back every cycle so calculations
//! can see their previous results.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use meridian_types::{
    CycleKind, InputDataModel, InputPoint, OutputSnapshot, PointAddress, Provenance, Reading, Sample,
    TimeSeries, Unit, Value,
};

use crate::adapter::AdapterSet;
use crate::allocation::{AllocationTable, ReadPlan, ResolvedPoint};
use crate::config::ReadMode;
use crate::error::AdapterError;

/// A read that did not return a live value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadFailure {
    pub key: String,
    pub address: String,
    pub error: String,
    /// The declared default was used instead
    pub fell_back: bool,
}

/// Assembled bundle plus what went wrong while reading it
#[derive(Debug, Clone)]
pub struct Assembly {
    pub data: InputDataModel,
    pub failures: Vec<ReadFailure>,
}

#[derive(Debug, Clone)]
struct StaticCache {
    points: Vec<InputPoint>,
    missing: Vec<String>,
}

pub struct InputAssembler {
    table: Arc<AllocationTable>,
    adapters: AdapterSet,
    static_cache: Mutex<Option<StaticCache>>,
}

impl InputAssembler {
    pub fn new(table: Arc<AllocationTable>, adapters: AdapterSet) -> Self {
        Self {
            table,
            adapters,
            static_cache: Mutex::new(None),
        }
    }

    /// Whether the next calculation cycle has to read static data
    ///
    /// Only before the first read. Keys that were missing stay missing
    /// until the next calibration.
    pub fn needs_static_refresh(&self) -> bool {
        self.static_cache.lock().is_none()
    }

    /// Assemble the input bundle for a cycle starting at `now`
    pub async fn assemble(&self, kind: CycleKind, now: DateTime<Utc>) -> Assembly {
        let deadline = Instant::now() + self.table.schedule.deadline;
        self.assemble_until(kind, now, deadline).await
    }

    /// Same as [`assemble`](Self::assemble) with an explicit I/O deadline
    pub async fn assemble_until(&self, kind: CycleKind, now: DateTime<Utc>, deadline: Instant) -> Assembly {
        let schedule = &self.table.schedule;
        let range = chrono::Duration::from_std(schedule.range_for(kind))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let start = now - range;

        let refresh_static = kind == CycleKind::Calibration || self.needs_static_refresh();

        let live_inputs: Vec<&ResolvedPoint> = self
            .table
            .inputs()
            .iter()
            .filter(|p| self.table.is_active(p) && matches!(p.plan, ReadPlan::Live(_)))
            .collect();
        let statics: Vec<&ResolvedPoint> = if refresh_static {
            self.table
                .static_data()
                .iter()
                .filter(|p| self.table.is_active(p))
                .collect()
        } else {
            Vec::new()
        };
        let outputs: Vec<&ResolvedPoint> = self
            .table
            .outputs()
            .iter()
            .filter(|p| self.table.is_active(p))
            .collect();
        // One read per address even when several output keys share it
        let mut output_addresses: Vec<&PointAddress> = Vec::new();
        for point in &outputs {
            if !output_addresses.contains(&&point.address) {
                output_addresses.push(&point.address);
            }
        }

        let (input_results, static_results, output_reads) = tokio::join!(
            join_all(live_inputs.iter().map(|p| self.read_point(p, start, now, deadline))),
            join_all(statics.iter().map(|p| self.read_point(p, start, now, deadline))),
            join_all(output_addresses.iter().map(|a| self.read_last(a, deadline))),
        );
        let last_values: HashMap<&PointAddress, Result<Reading, AdapterError>> =
            output_addresses.into_iter().zip(output_reads).collect();

        let mut data = InputDataModel::new(kind, now);
        let mut failures = Vec::new();

        for (point, result) in live_inputs.iter().zip(input_results) {
            if let Some(input) = settle(point, result, now, &mut failures, &mut data.missing) {
                data.inputs.push(input);
            }
        }

        for point in &outputs {
            match last_values.get(&point.address) {
                Some(Ok(reading)) => data.last_outputs.push(OutputSnapshot {
                    key: point.key.clone(),
                    address: point.address.clone(),
                    value: reading.value.clone(),
                    timestamp: Some(reading.timestamp),
                }),
                Some(Err(e)) => debug!(key = %point.key, error = %e, "No previous output value"),
                None => {}
            }
        }

        // Inputs that read back an output are served from the snapshots above
        for point in self.table.inputs().iter().filter(|p| self.table.is_active(p)) {
            let ReadPlan::LastOutput { output_key } = &point.plan else {
                continue;
            };
            let result = data
                .last_output(output_key)
                .map(|snapshot| InputPoint {
                    key: point.key.clone(),
                    address: point.address.clone(),
                    value: snapshot.value.clone(),
                    unit: point.unit,
                    timestamp: snapshot.timestamp.unwrap_or(now),
                    provenance: Provenance::Live,
                })
                .ok_or_else(|| AdapterError::unavailable(&point.address, format!("output '{output_key}' has no previous value")));
            if let Some(input) = settle(point, result, now, &mut failures, &mut data.missing) {
                data.inputs.push(input);
            }
        }

        if refresh_static {
            let mut points = Vec::new();
            let mut missing = Vec::new();
            for (point, result) in statics.iter().zip(static_results) {
                if let Some(input) = settle(point, result, now, &mut failures, &mut missing) {
                    points.push(input);
                }
            }
            *self.static_cache.lock() = Some(StaticCache {
                points: points.clone(),
                missing: missing.clone(),
            });
            data.static_data = points;
            data.missing.extend(missing);
        } else if let Some(cache) = &*self.static_cache.lock() {
            data.static_data = cache.points.clone();
            data.missing.extend(cache.missing.iter().cloned());
        }

        debug!(
            kind = %kind,
            inputs = data.inputs.len(),
            static_data = data.static_data.len(),
            last_outputs = data.last_outputs.len(),
            missing = data.missing.len(),
            "Input bundle assembled"
        );

        Assembly { data, failures }
    }

    async fn read_point(
        &self,
        point: &ResolvedPoint,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<InputPoint, AdapterError> {
        let adapter = self.adapters.get(point.address.interface)?;
        let mode = point.read_mode().unwrap_or_default();

        let read = async {
            match mode {
                ReadMode::Point => {
                    let reading = adapter.fetch_current(&point.address).await?;
                    Ok::<_, AdapterError>((reading.value, reading.unit, reading.timestamp))
                }
                ReadMode::Range => {
                    let readings = adapter.fetch_range(&point.address, start, end).await?;
                    series_from(point, readings)
                }
            }
        };

        let (value, unit, timestamp) = tokio::time::timeout_at(deadline, read)
            .await
            .map_err(|_| AdapterError::DeadlineExceeded {
                address: point.address.to_string(),
            })??;

        if let (Some(declared), Some(reported)) = (point.unit, unit) {
            if declared != reported {
                warn!(key = %point.key, declared = %declared, reported = %reported, "Source reports a different unit than declared");
            }
        }

        Ok(InputPoint {
            key: point.key.clone(),
            address: point.address.clone(),
            value,
            unit: point.unit.or(unit),
            timestamp,
            provenance: Provenance::Live,
        })
    }

    async fn read_last(&self, address: &PointAddress, deadline: Instant) -> Result<Reading, AdapterError> {
        let adapter = self.adapters.get(address.interface)?;
        tokio::time::timeout_at(deadline, adapter.fetch_current(address))
            .await
            .map_err(|_| AdapterError::DeadlineExceeded {
                address: address.to_string(),
            })?
    }
}

impl std::fmt::Debug for InputAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputAssembler")
            .field("adapters", &self.adapters)
            .field("static_cached", &self.static_cache.lock().is_some())
            .finish()
    }
}

/// Turn range readings into one value: a series when every sample is numeric
fn series_from(
    point: &ResolvedPoint,
    readings: Vec<Reading>,
) -> Result<(Value, Option<Unit>, DateTime<Utc>), AdapterError> {
    let Some(last) = readings.last() else {
        return Err(AdapterError::unavailable(&point.address, "no samples in range"));
    };
    let timestamp = last.timestamp;
    let unit = readings.iter().find_map(|r| r.unit);

    let numeric = readings
        .iter()
        .all(|r| matches!(r.value, Value::Int(_) | Value::Float(_)));
    let value = if numeric {
        Value::Series(
            readings
                .iter()
                .filter_map(|r| r.value.as_f64().map(|v| Sample::new(r.timestamp, v)))
                .collect::<TimeSeries>(),
        )
    } else {
        Value::Array(readings.into_iter().map(|r| r.value).collect())
    };
    Ok((value, unit, timestamp))
}

/// Apply the partial-failure policy to one read result
fn settle(
    point: &ResolvedPoint,
    result: Result<InputPoint, AdapterError>,
    now: DateTime<Utc>,
    failures: &mut Vec<ReadFailure>,
    missing: &mut Vec<String>,
) -> Option<InputPoint> {
    let error = match result {
        Ok(input) => return Some(input),
        Err(e) => e,
    };

    let fell_back = point.default.is_some();
    warn!(key = %point.key, address = %point.address, error = %error, fell_back, "Read failed");
    failures.push(ReadFailure {
        key: point.key.clone(),
        address: point.address.to_string(),
        error: error.to_string(),
        fell_back,
    });

    match &point.default {
        Some(default) => Some(InputPoint {
            key: point.key.clone(),
            address: point.address.clone(),
            value: default.clone(),
            unit: point.unit,
            timestamp: now,
            provenance: Provenance::Default,
        }),
        None => {
            missing.push(point.key.clone());
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::TimeZone;
    use meridian_types::{Granularity, InterfaceKind};

    use crate::adapter::MemoryAdapter;
    use crate::allocation::resolve;
    use crate::component::ComponentRegistry;
    use crate::config::{ConfigModel, ControllerSettings, CycleTiming, InterfaceSet, IoAllocation};

    fn config(read_mode: ReadMode) -> ConfigModel {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "temp_top".to_string(),
            IoAllocation::new("tank1", "T1").with_read_mode(read_mode),
        );
        inputs.insert(
            "temp_bottom".to_string(),
            IoAllocation::new("tank1", "T2").with_read_mode(read_mode),
        );
        let mut settings = ControllerSettings::new(
            CycleTiming::new(1, Granularity::Minute).with_range(1, Granularity::Hour),
        );
        settings.time_settings.calibration =
            Some(CycleTiming::new(1, Granularity::Day).with_range(1, Granularity::Month));

        ConfigModel {
            name: "tank".into(),
            interfaces: InterfaceSet::only(InterfaceKind::Timeseries),
            inputs,
            outputs: BTreeMap::new(),
            static_data: BTreeMap::new(),
            controller_components: Vec::new(),
            controller_settings: settings,
        }
    }

    fn setup(config: &ConfigModel) -> (Arc<MemoryAdapter>, InputAssembler) {
        let table = Arc::new(resolve(config, &ComponentRegistry::new()).unwrap());
        let adapter = Arc::new(MemoryAdapter::new(InterfaceKind::Timeseries));
        let adapters = AdapterSet::new().with(adapter.clone());
        (adapter, InputAssembler::new(table, adapters))
    }

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_point_reads_one_per_key() {
        let (adapter, assembler) = setup(&config(ReadMode::Point));
        adapter.set("tank1", "T1", 61.0, t(11, 59));
        adapter.set("tank1", "T2", 40.0, t(11, 59));

        let assembly = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;

        assert_eq!(adapter.current_reads(), 2);
        assert!(adapter.range_reads().is_empty());
        assert_eq!(assembly.data.inputs.len(), 2);
        assert_eq!(assembly.data.value("temp_top"), Some(&Value::Float(61.0)));
        assert!(assembly.failures.is_empty());
    }

    #[tokio::test]
    async fn test_range_reads_cover_granularity() {
        let (adapter, assembler) = setup(&config(ReadMode::Range));
        for minute in [0, 30, 59] {
            adapter.set("tank1", "T1", minute as f64, t(11, minute));
            adapter.set("tank1", "T2", minute as f64, t(11, minute));
        }

        let now = t(12, 0);
        let assembly = assembler.assemble(CycleKind::Calculation, now).await;

        let ranges = adapter.range_reads();
        assert_eq!(ranges.len(), 2);
        for (_, start, end) in &ranges {
            assert_eq!(*end, now);
            assert_eq!(*end - *start, chrono::Duration::hours(1));
        }
        let series = assembly.data.input("temp_top").unwrap().value.as_series().unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(assembly.data.input("temp_top").unwrap().timestamp, t(11, 59));
    }

    #[tokio::test]
    async fn test_calibration_range_is_thirty_days() {
        let (adapter, assembler) = setup(&config(ReadMode::Range));
        adapter.set("tank1", "T1", 1.0, t(0, 0));
        adapter.set("tank1", "T2", 1.0, t(0, 0));

        let now = t(12, 0);
        assembler.assemble(CycleKind::Calibration, now).await;

        for (_, start, end) in adapter.range_reads() {
            assert_eq!(end - start, chrono::Duration::hours(30 * 24));
        }
    }

    #[tokio::test]
    async fn test_failed_read_uses_default() {
        let mut config = config(ReadMode::Point);
        config
            .inputs
            .get_mut("temp_top")
            .unwrap()
            .default = Some(Value::Float(55.0));
        let (adapter, assembler) = setup(&config);
        adapter.set("tank1", "T2", 40.0, t(11, 59));
        adapter.fail_reads("tank1", "T1");
        adapter.fail_reads("tank1", "T2");

        let assembly = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;

        let top = assembly.data.input("temp_top").unwrap();
        assert_eq!(top.value, Value::Float(55.0));
        assert_eq!(top.provenance, Provenance::Default);
        assert!(assembly.data.input("temp_bottom").is_none());
        assert_eq!(assembly.data.missing, vec!["temp_bottom".to_string()]);
        assert_eq!(assembly.failures.len(), 2);
        assert_eq!(assembly.failures.iter().filter(|f| f.fell_back).count(), 1);
    }

    #[tokio::test]
    async fn test_empty_range_counts_as_failure() {
        let (_adapter, assembler) = setup(&config(ReadMode::Range));
        let assembly = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;
        assert_eq!(assembly.data.missing.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_slow_reads() {
        let (adapter, assembler) = setup(&config(ReadMode::Point));
        adapter.set("tank1", "T1", 1.0, t(11, 0));
        adapter.set("tank1", "T2", 1.0, t(11, 0));
        // deadline is 54s for a one minute cycle
        adapter.set_read_delay(Some(Duration::from_secs(120)));

        let assembly = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;

        assert_eq!(assembly.data.missing.len(), 2);
        assert!(assembly
            .failures
            .iter()
            .all(|f| f.error.contains("deadline exceeded")));
    }

    #[tokio::test]
    async fn test_static_data_cached_between_calibrations() {
        let mut config = config(ReadMode::Point);
        config
            .static_data
            .insert("setpoint".into(), IoAllocation::new("params", "setpoint"));
        let (adapter, assembler) = setup(&config);
        adapter.set("params", "setpoint", 60.0, t(0, 0));

        let first = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;
        assert_eq!(first.data.value("setpoint"), Some(&Value::Float(60.0)));
        assert!(!assembler.needs_static_refresh());

        adapter.set("params", "setpoint", 65.0, t(12, 0));
        adapter.clear_calls();
        let second = assembler.assemble(CycleKind::Calculation, t(12, 1)).await;
        assert_eq!(second.data.value("setpoint"), Some(&Value::Float(60.0)));
        assert!(!adapter
            .calls()
            .iter()
            .any(|c| matches!(c, crate::adapter::AdapterCall::FetchCurrent(a) if a.entity == "params")));

        let calibration = assembler.assemble(CycleKind::Calibration, t(12, 2)).await;
        assert_eq!(calibration.data.value("setpoint"), Some(&Value::Float(65.0)));
    }

    #[tokio::test]
    async fn test_shared_output_address_read_once() {
        let mut config = config(ReadMode::Point);
        config
            .outputs
            .insert("pump".into(), IoAllocation::new("pump1", "command"));
        config
            .outputs
            .insert("pump_copy".into(), IoAllocation::new("pump1", "command"));
        let (adapter, assembler) = setup(&config);
        adapter.set("tank1", "T1", 61.0, t(11, 59));
        adapter.set("tank1", "T2", 40.0, t(11, 59));
        adapter.set("pump1", "command", 1, t(11, 58));

        let assembly = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;

        let pump_reads = adapter
            .calls()
            .iter()
            .filter(|c| matches!(c, crate::adapter::AdapterCall::FetchCurrent(a) if a.entity == "pump1"))
            .count();
        assert_eq!(pump_reads, 1);
        assert_eq!(assembly.data.last_outputs.len(), 2);
        assert_eq!(assembly.data.value("pump_copy"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_missing_static_key_waits_for_calibration() {
        let mut config = config(ReadMode::Point);
        config
            .static_data
            .insert("setpoint".into(), IoAllocation::new("params", "setpoint"));
        config
            .static_data
            .insert("limit".into(), IoAllocation::new("params", "limit"));
        let (adapter, assembler) = setup(&config);
        adapter.set("params", "setpoint", 60.0, t(0, 0));

        let first = assembler.assemble(CycleKind::Calculation, t(12, 0)).await;
        assert_eq!(first.data.value("setpoint"), Some(&Value::Float(60.0)));
        assert!(first.data.missing.contains(&"limit".to_string()));
        assert!(!assembler.needs_static_refresh());

        adapter.set("params", "setpoint", 65.0, t(12, 0));
        adapter.set("params", "limit", 80.0, t(12, 0));
        adapter.clear_calls();
        let second = assembler.assemble(CycleKind::Calculation, t(12, 1)).await;
        assert_eq!(second.data.value("setpoint"), Some(&Value::Float(60.0)));
        assert!(second.data.missing.contains(&"limit".to_string()));
        assert!(!adapter
            .calls()
            .iter()
            .any(|c| matches!(c, crate::adapter::AdapterCall::FetchCurrent(a) if a.entity == "params")));

        let calibration = assembler.assemble(CycleKind::Calibration, t(12, 2)).await;
        assert_eq!(calibration.data.value("setpoint"), Some(&Value::Float(65.0)));
        assert_eq!(calibration.data.value("limit"), Some(&Value::Float(80.0)));
        assert!(calibration.data.missing.is_empty());
    }
}
