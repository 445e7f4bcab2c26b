//! Output Dispatch
//!
//! Writes a calculation's result set through the adapters, one batch per
//! interface. Each point still gets its own status: a rejected write is
//! recorded in its outcome and the rest of the batch carries on. The caller always gets exactly one
//! outcome per result point, in input order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use meridian_types::{DataTransferModel, InterfaceKind, PointAddress, ResultPoint, Unit};

use crate::adapter::{AdapterSet, PointWrite};
use crate::allocation::AllocationTable;
use crate::error::AdapterError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteStatus {
    Written,
    Failed { reason: String },
}

/// Result of writing one result point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub entity: String,
    pub attribute: String,
    /// Interface written to, when the point could be resolved
    pub interface: Option<InterfaceKind>,
    #[serde(flatten)]
    pub status: WriteStatus,
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        self.status == WriteStatus::Written
    }
}

pub struct OutputDispatcher {
    table: Arc<AllocationTable>,
    adapters: AdapterSet,
}

impl OutputDispatcher {
    pub fn new(table: Arc<AllocationTable>, adapters: AdapterSet) -> Self {
        Self { table, adapters }
    }

    /// Write every point of `results`, never failing as a whole
    pub async fn dispatch(&self, results: &DataTransferModel, now: DateTime<Utc>) -> Vec<WriteOutcome> {
        let deadline = Instant::now() + self.table.schedule.deadline;
        self.dispatch_until(results, now, deadline).await
    }

    /// Same as [`dispatch`](Self::dispatch) with an explicit I/O deadline.
    /// Points bound for one interface reach its adapter as a single batch.
    pub async fn dispatch_until(
        &self,
        results: &DataTransferModel,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Vec<WriteOutcome> {
        let points: Vec<&ResultPoint> = results.iter().collect();
        let mut outcomes: Vec<Option<WriteOutcome>> = vec![None; points.len()];
        let mut batches: BTreeMap<InterfaceKind, Vec<(usize, PointWrite)>> = BTreeMap::new();

        for (index, point) in points.iter().enumerate() {
            match self.target(point) {
                Ok((address, declared_unit)) => {
                    let write = PointWrite {
                        unit: point.unit.or(declared_unit),
                        timestamp: point.governing_timestamp(now),
                        value: point.value.clone(),
                        address,
                    };
                    batches.entry(write.address.interface).or_default().push((index, write));
                }
                Err(reason) => {
                    warn!(entity = %point.entity, attribute = %point.attribute, reason = %reason, "Result point not written");
                    outcomes[index] = Some(outcome(point, point.interface, WriteStatus::Failed { reason }));
                }
            }
        }

        let written = join_all(
            batches
                .into_iter()
                .map(|(kind, batch)| self.write_batch(kind, batch, deadline)),
        )
        .await;

        for (index, address, result) in written.into_iter().flatten() {
            let status = match result {
                Ok(()) => WriteStatus::Written,
                Err(e) => {
                    warn!(address = %address, error = %e, "Write failed");
                    WriteStatus::Failed { reason: e.to_string() }
                }
            };
            outcomes[index] = Some(outcome(points[index], Some(address.interface), status));
        }

        let outcomes: Vec<WriteOutcome> = outcomes
            .into_iter()
            .zip(&points)
            .map(|(written, point)| {
                written.unwrap_or_else(|| {
                    let reason = "adapter returned no result for the point".to_string();
                    outcome(point, point.interface, WriteStatus::Failed { reason })
                })
            })
            .collect();

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        debug!(written = outcomes.len() - failed, failed, "Result set dispatched");
        outcomes
    }

    async fn write_batch(
        &self,
        kind: InterfaceKind,
        batch: Vec<(usize, PointWrite)>,
        deadline: Instant,
    ) -> Vec<(usize, PointAddress, Result<(), AdapterError>)> {
        let (indices, writes): (Vec<usize>, Vec<PointWrite>) = batch.into_iter().unzip();

        let results = match self.adapters.get(kind) {
            Ok(adapter) => match tokio::time::timeout_at(deadline, adapter.write_batch(&writes)).await {
                Ok(results) => results,
                Err(_) => writes
                    .iter()
                    .map(|w| {
                        Err(AdapterError::DeadlineExceeded {
                            address: w.address.to_string(),
                        })
                    })
                    .collect(),
            },
            Err(e) => vec![Err(e); writes.len()],
        };

        indices
            .into_iter()
            .zip(writes)
            .zip(results)
            .map(|((index, write), result)| (index, write.address, result))
            .collect()
    }

    /// Declared output address for a result point
    fn target(&self, point: &ResultPoint) -> Result<(PointAddress, Option<Unit>), String> {
        let matches = self
            .table
            .find_outputs(&point.entity, &point.attribute, point.interface);

        let Some(first) = matches.first() else {
            return Err(format!(
                "no output declared for {}/{}",
                point.entity, point.attribute
            ));
        };
        if matches.iter().any(|m| m.address.interface != first.address.interface) {
            return Err(format!(
                "{}/{} is declared on several interfaces; the result must name one",
                point.entity, point.attribute
            ));
        }
        let unit = matches.iter().find_map(|m| m.unit);
        Ok((first.address.clone(), unit))
    }
}

fn outcome(point: &ResultPoint, interface: Option<InterfaceKind>, status: WriteStatus) -> WriteOutcome {
    WriteOutcome {
        entity: point.entity.clone(),
        attribute: point.attribute.clone(),
        interface,
        status,
    }
}

impl std::fmt::Debug for OutputDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDispatcher")
            .field("adapters", &self.adapters)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use meridian_types::{Granularity, Sample, TimeSeries, Value};

    use crate::adapter::MemoryAdapter;
    use crate::allocation::resolve;
    use crate::component::ComponentRegistry;
    use crate::config::{ConfigModel, ControllerSettings, CycleTiming, InterfaceSet, IoAllocation};

    fn setup() -> (Arc<MemoryAdapter>, Arc<MemoryAdapter>, OutputDispatcher) {
        let mut outputs = BTreeMap::new();
        for attribute in ["a", "b", "c", "d"] {
            outputs.insert(
                attribute.to_string(),
                IoAllocation::new("plant", attribute)
                    .with_interface(InterfaceKind::Context)
                    .with_unit("WTT"),
            );
        }
        outputs.insert(
            "report".to_string(),
            IoAllocation::new("plant", "report").with_interface(InterfaceKind::Timeseries),
        );
        outputs.insert(
            "report_ctx".to_string(),
            IoAllocation::new("plant", "report").with_interface(InterfaceKind::Context),
        );

        let mut interfaces = InterfaceSet::only(InterfaceKind::Context);
        interfaces.enable(InterfaceKind::Timeseries);
        let config = ConfigModel {
            name: "dispatch".into(),
            interfaces,
            inputs: BTreeMap::new(),
            outputs,
            static_data: BTreeMap::new(),
            controller_components: Vec::new(),
            controller_settings: ControllerSettings::new(CycleTiming::new(1, Granularity::Minute)),
        };
        let table = Arc::new(resolve(&config, &ComponentRegistry::new()).unwrap());

        let context = Arc::new(MemoryAdapter::new(InterfaceKind::Context));
        let timeseries = Arc::new(MemoryAdapter::new(InterfaceKind::Timeseries));
        let adapters = AdapterSet::new().with(context.clone()).with(timeseries.clone());
        (context, timeseries, OutputDispatcher::new(table, adapters))
    }

    #[tokio::test]
    async fn test_partial_write_failure_reports_every_point() {
        let (context, _, dispatcher) = setup();
        context.fail_writes("plant", "b");
        context.fail_writes("plant", "d");

        let results: DataTransferModel = ["a", "b", "c", "d"]
            .into_iter()
            .map(|attr| ResultPoint::new("plant", attr, 1.0))
            .collect();
        let outcomes = dispatcher.dispatch(&results, Utc::now()).await;

        assert_eq!(outcomes.len(), 4);
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.attribute.as_str())
            .collect();
        assert_eq!(failed, vec!["b", "d"]);
        assert_eq!(context.writes().len(), 4);
        assert!(context.latest("plant", "c").is_some());
    }

    #[tokio::test]
    async fn test_unit_and_series_timestamp_tagging() {
        let (context, _, dispatcher) = setup();
        let now = Utc::now();
        let end = now - chrono::Duration::minutes(5);
        let series = TimeSeries::new(vec![
            Sample::new(end - chrono::Duration::minutes(1), 1.0),
            Sample::new(end, 2.0),
        ]);

        let results: DataTransferModel = vec![ResultPoint::new("plant", "a", series)].into_iter().collect();
        let outcomes = dispatcher.dispatch(&results, now).await;
        assert!(outcomes[0].is_success());

        let written = context.latest("plant", "a").unwrap();
        assert_eq!(written.unit, Some(Unit::Watt));
        assert_eq!(written.timestamp, end);
    }

    #[tokio::test]
    async fn test_unresolved_and_ambiguous_points_fail_alone() {
        let (_, timeseries, dispatcher) = setup();
        let results: DataTransferModel = vec![
            ResultPoint::new("plant", "unknown", 1.0),
            ResultPoint::new("plant", "report", Value::from("ok")),
            ResultPoint::new("plant", "report", Value::from("ok")).on_interface(InterfaceKind::Timeseries),
        ]
        .into_iter()
        .collect();

        let outcomes = dispatcher.dispatch(&results, Utc::now()).await;

        assert_eq!(outcomes.len(), 3);
        assert!(!outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(outcomes[2].interface, Some(InterfaceKind::Timeseries));
        assert_eq!(timeseries.writes().len(), 1);
    }
}
