// Controller Service - Drives calculation and calibration cycles
//
// Ticks once per calculation interval. A tick first runs a calibration
// cycle when one is due, then the calculation cycle. Every finished cycle
// is announced on the event bus.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use meridian_runtime::service::{Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};
use meridian_runtime::{CycleReport, CycleRunner, CycleStatus, Schedule};
use meridian_types::CycleKind;

pub const SERVICE_ID: &str = "controller";

pub const CYCLE_COMPLETED: &str = "cycle/completed";
pub const CYCLE_FAILED: &str = "cycle/failed";

/// Event payload describing one finished cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub status: CycleStatus,
    pub finished_at: DateTime<Utc>,
    pub read_failures: usize,
    pub failed_components: usize,
    pub failed_writes: usize,
}

impl From<&CycleReport> for CycleSummary {
    fn from(report: &CycleReport) -> Self {
        Self {
            cycle_id: report.id,
            kind: report.kind,
            status: report.status,
            finished_at: report.finished_at,
            read_failures: report.read_failures.len(),
            failed_components: report.failed_components(),
            failed_writes: report.failed_writes(),
        }
    }
}

pub struct ControllerService {
    runner: CycleRunner,
    schedule: Schedule,
    calibrate_on_start: bool,
    last_calibration: Option<Instant>,
}

impl ControllerService {
    pub fn new(runner: CycleRunner) -> Self {
        let schedule = runner.table().schedule;
        Self {
            calibrate_on_start: schedule.calibrate_on_startup,
            runner,
            schedule,
            last_calibration: None,
        }
    }

    /// Force a calibration cycle before the first calculation
    pub fn calibrate_on_start(mut self, enabled: bool) -> Self {
        self.calibrate_on_start |= enabled;
        self
    }

    /// Calibration is due once its interval has passed since the last one
    fn calibration_due(&self, now: Instant) -> bool {
        match (self.schedule.calibration_interval, self.last_calibration) {
            (Some(interval), Some(last)) => now.duration_since(last) >= interval,
            _ => false,
        }
    }

    async fn run_cycle(&mut self, ctx: &ServiceContext, kind: CycleKind) -> CycleReport {
        let report = self.runner.run(kind, Utc::now()).await;
        if kind == CycleKind::Calibration {
            self.last_calibration = Some(Instant::now());
        }

        let summary = CycleSummary::from(&report);
        let event_type = match report.status {
            CycleStatus::Failed => CYCLE_FAILED,
            _ => CYCLE_COMPLETED,
        };
        match ctx.emit_data(event_type, &summary) {
            Ok(()) | Err(ServiceError::NoReceivers) => {}
            Err(e) => warn!(error = %e, "Failed to publish cycle summary"),
        }
        report
    }
}

#[async_trait]
impl Service for ControllerService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(SERVICE_ID, "Cycle Controller")
            .with_tick_interval(self.schedule.calculation_interval)
            .with_shutdown_timeout(Duration::from_secs(10))
    }

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        if self.calibrate_on_start {
            self.run_cycle(ctx, CycleKind::Calibration).await;
        } else {
            // The first calculation loads static data; calibration timing starts now
            self.last_calibration = Some(Instant::now());
        }
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let started = Instant::now();

        if self.calibration_due(started) {
            self.run_cycle(ctx, CycleKind::Calibration).await;
        }
        self.run_cycle(ctx, CycleKind::Calculation).await;

        let elapsed = started.elapsed();
        if elapsed > self.schedule.calculation_interval {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.schedule.calculation_interval.as_millis() as u64,
                "Cycle took longer than its sampling time"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for ControllerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerService")
            .field("runner", &self.runner)
            .field("schedule", &self.schedule)
            .finish()
    }
}
