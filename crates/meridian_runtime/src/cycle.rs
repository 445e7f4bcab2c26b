//! Cycle Runner
//!
//! One cycle is: assemble inputs, run components and the calculation hook,
//! dispatch the results. All reads finish before any component runs and
//! all components finish before any write. Per-cycle problems end up in the
//! [`CycleReport`]; nothing here returns an error once startup succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use meridian_types::{CycleKind, DataTransferModel, InputDataModel};

use crate::adapter::AdapterSet;
use crate::allocation::AllocationTable;
use crate::assembly::{InputAssembler, ReadFailure};
use crate::component::{ComponentManager, ComponentOutcome, ComponentRegistry};
use crate::dispatch::{OutputDispatcher, WriteOutcome};
use crate::error::{ComponentError, ConfigError};

// ─────────────────────────────────────────────────────────────────────────────
// Calculation Hook
// ─────────────────────────────────────────────────────────────────────────────

/// User calculation and calibration entry points
#[async_trait]
pub trait CalculationHook: Send + Sync + 'static {
    async fn calculation(&self, data: &InputDataModel) -> Result<DataTransferModel, ComponentError>;

    /// Runs on calibration cycles; may return results to write
    async fn calibration(&self, _data: &InputDataModel) -> Result<Option<DataTransferModel>, ComponentError> {
        Ok(None)
    }
}

/// Hook for deployments driven entirely by components
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCalculation;

#[async_trait]
impl CalculationHook for NoCalculation {
    async fn calculation(&self, _data: &InputDataModel) -> Result<DataTransferModel, ComponentError> {
        Ok(DataTransferModel::new())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cycle Report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Succeeded,
    Partial,
    Failed,
}

/// Everything that happened in one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub id: Uuid,
    pub kind: CycleKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub read_failures: Vec<ReadFailure>,
    pub defaults_used: usize,
    pub component_outcomes: Vec<ComponentOutcome>,
    /// Set when the calculation hook failed
    pub hook_error: Option<String>,
    pub write_outcomes: Vec<WriteOutcome>,
    pub status: CycleStatus,
}

impl CycleReport {
    pub fn failed_writes(&self) -> usize {
        self.write_outcomes.iter().filter(|o| !o.is_success()).count()
    }

    pub fn failed_components(&self) -> usize {
        self.component_outcomes.iter().filter(|o| o.is_failure()).count()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    fn classify(&mut self) {
        let active: Vec<_> = self
            .component_outcomes
            .iter()
            .filter(|o| o.is_success() || o.is_failure())
            .collect();
        let none_succeeded = if active.is_empty() {
            self.hook_error.is_some()
        } else {
            active.iter().all(|o| o.is_failure())
        };

        self.status = if none_succeeded {
            CycleStatus::Failed
        } else if !self.read_failures.is_empty()
            || self.defaults_used > 0
            || self.failed_components() > 0
            || self.hook_error.is_some()
            || self.failed_writes() > 0
        {
            CycleStatus::Partial
        } else {
            CycleStatus::Succeeded
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cycle Runner
// ─────────────────────────────────────────────────────────────────────────────

pub struct CycleRunner {
    table: Arc<AllocationTable>,
    assembler: InputAssembler,
    components: ComponentManager,
    dispatcher: OutputDispatcher,
    hook: Arc<dyn CalculationHook>,
}

impl CycleRunner {
    /// Wire up a runner; fails if an enabled interface has no adapter or a
    /// component cannot be constructed
    pub fn new(
        table: Arc<AllocationTable>,
        adapters: AdapterSet,
        registry: &ComponentRegistry,
        hook: Arc<dyn CalculationHook>,
    ) -> Result<Self, ConfigError> {
        adapters.ensure_covers(&table.interfaces)?;
        let components = ComponentManager::construct(Arc::clone(&table), registry)?;

        Ok(Self {
            assembler: InputAssembler::new(Arc::clone(&table), adapters.clone()),
            dispatcher: OutputDispatcher::new(Arc::clone(&table), adapters),
            components,
            hook,
            table,
        })
    }

    pub fn table(&self) -> &Arc<AllocationTable> {
        &self.table
    }

    pub fn components(&self) -> &ComponentManager {
        &self.components
    }

    pub async fn run_calculation(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.run(CycleKind::Calculation, now).await
    }

    pub async fn run_calibration(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.run(CycleKind::Calibration, now).await
    }

    /// Run one cycle whose reference time is `now`
    pub async fn run(&mut self, kind: CycleKind, now: DateTime<Utc>) -> CycleReport {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.table.schedule.deadline;

        let assembly = self.assembler.assemble_until(kind, now, deadline).await;
        let data = assembly.data;

        let (component_outcomes, mut results, hook_result) = match kind {
            CycleKind::Calculation => {
                let (outcomes, results) = self.components.run(&data);
                let hook_result = self.hook.calculation(&data).await.map(Some);
                (outcomes, results, hook_result)
            }
            CycleKind::Calibration => {
                let outcomes = self.components.calibrate(&data);
                let hook_result = self.hook.calibration(&data).await;
                (outcomes, DataTransferModel::new(), hook_result)
            }
        };

        let hook_error = match hook_result {
            Ok(Some(extra)) => {
                results.extend(extra);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Calculation hook failed");
                Some(e.to_string())
            }
        };

        // A slow calculation must not starve the writes
        let write_deadline = deadline.max(Instant::now() + self.table.schedule.write_budget);
        let write_outcomes = self.dispatcher.dispatch_until(&results, now, write_deadline).await;

        let mut report = CycleReport {
            id: Uuid::new_v4(),
            kind,
            started_at,
            finished_at: Utc::now(),
            read_failures: assembly.failures,
            defaults_used: data.default_count(),
            component_outcomes,
            hook_error,
            write_outcomes,
            status: CycleStatus::Succeeded,
        };
        report.classify();

        info!(
            cycle_id = %report.id,
            kind = %kind,
            status = ?report.status,
            read_failures = report.read_failures.len(),
            failed_components = report.failed_components(),
            writes = report.write_outcomes.len(),
            failed_writes = report.failed_writes(),
            duration_ms = report.duration().num_milliseconds(),
            "Cycle finished"
        );
        report
    }
}

impl std::fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleRunner")
            .field("name", &self.table.name)
            .field("components", &self.components)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
