// Health Service - Records when the last cycle completed
//
// Writes the finish time of every completed cycle to the health file. An
// external health check calls `check_health` to see whether that time is recent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use meridian_runtime::service::{Event, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};

use super::controller::{CYCLE_COMPLETED, CYCLE_FAILED, CycleSummary};

pub const SERVICE_ID: &str = "health";

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("cannot read health file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("health file holds no valid timestamp: {0}")]
    Invalid(String),

    #[error("last cycle completed at {last}, more than {max_age:?} ago")]
    Stale { last: DateTime<Utc>, max_age: Duration },
}

/// Succeeds with the last completion time when it is at most `max_age` old
pub async fn check_health(path: &Path, max_age: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>, HealthError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| HealthError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let last = DateTime::parse_from_rfc3339(content.trim())
        .map_err(|_| HealthError::Invalid(content.trim().to_string()))?
        .with_timezone(&Utc);

    let age = (now - last).to_std().unwrap_or(Duration::ZERO);
    if age > max_age {
        return Err(HealthError::Stale { last, max_age });
    }
    Ok(last)
}

pub struct HealthService {
    path: PathBuf,
    last_completed: Option<DateTime<Utc>>,
}

impl HealthService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_completed: None,
        }
    }

    async fn record(&mut self, finished_at: DateTime<Utc>) -> ServiceResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Failed(e.to_string()))?;
        }
        tokio::fs::write(&self.path, finished_at.to_rfc3339())
            .await
            .map_err(|e| ServiceError::Failed(format!("writing {}: {e}", self.path.display())))?;
        self.last_completed = Some(finished_at);
        debug!(path = %self.path.display(), %finished_at, "Health file updated");
        Ok(())
    }
}

#[async_trait]
impl Service for HealthService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(SERVICE_ID, "Health Reporter").subscribe("cycle/*")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        let summary: CycleSummary = event
            .parse_data()
            .map_err(|e| ServiceError::Failed(format!("invalid cycle event: {e}")))?;

        match event.event_type.as_str() {
            CYCLE_COMPLETED => self.record(summary.finished_at).await,
            CYCLE_FAILED => {
                warn!(cycle_id = %summary.cycle_id, kind = %summary.kind, "Cycle failed, health file not updated");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_runtime::CycleStatus;
    use meridian_runtime::service::{EventPublisher, ServiceManager};
    use meridian_types::CycleKind;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn summary(status: CycleStatus, finished_at: DateTime<Utc>) -> CycleSummary {
        CycleSummary {
            cycle_id: Uuid::new_v4(),
            kind: CycleKind::Calculation,
            status,
            finished_at,
            read_failures: 0,
            failed_components: 0,
            failed_writes: 0,
        }
    }

    fn context() -> ServiceContext {
        let (tx, _) = tokio::sync::broadcast::channel(4);
        ServiceContext::new(SERVICE_ID.into(), EventPublisher::new(tx))
    }

    #[tokio::test]
    async fn test_completed_cycle_updates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("health");
        let mut service = HealthService::new(&path);
        let ctx = context();
        let finished = Utc::now();

        let completed = Event::with_data(CYCLE_COMPLETED, "controller", &summary(CycleStatus::Partial, finished)).unwrap();
        service.on_event(&ctx, completed).await.unwrap();

        let last = check_health(&path, Duration::from_secs(60), finished).await.unwrap();
        assert_eq!(last.timestamp(), finished.timestamp());

        // Failed cycles leave the file alone
        let later = finished + chrono::Duration::minutes(5);
        let failed = Event::with_data(CYCLE_FAILED, "controller", &summary(CycleStatus::Failed, later)).unwrap();
        service.on_event(&ctx, failed).await.unwrap();
        assert_eq!(service.last_completed, Some(finished));
    }

    #[tokio::test]
    async fn test_stale_and_missing_health() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("health");
        let now = Utc::now();

        assert!(matches!(
            check_health(&path, Duration::from_secs(60), now).await,
            Err(HealthError::Read { .. })
        ));

        tokio::fs::write(&path, (now - chrono::Duration::minutes(10)).to_rfc3339()).await.unwrap();
        assert!(matches!(
            check_health(&path, Duration::from_secs(60), now).await,
            Err(HealthError::Stale { .. })
        ));

        tokio::fs::write(&path, "garbage").await.unwrap();
        assert!(matches!(
            check_health(&path, Duration::from_secs(60), now).await,
            Err(HealthError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribed_to_cycle_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("health");
        let manager = ServiceManager::new();
        let handle = manager.spawn(HealthService::new(&path)).await.unwrap();
        handle.started().await.unwrap();

        let event = Event::with_data(CYCLE_COMPLETED, "controller", &summary(CycleStatus::Succeeded, Utc::now())).unwrap();
        manager.publish_event(event);

        let mut written = false;
        for _ in 0..50 {
            if path.exists() {
                written = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(written);
        manager.shutdown_all().await.unwrap();
    }
}
