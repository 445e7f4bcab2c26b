//! Service Manager
//!
//! Spawns services onto the runtime, routes bus events to them and stops
//! them again.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    Event, EventPublisher, Service, ServiceContext, ServiceError, ServiceHandle, ServiceResult,
    ServiceSpec, ServiceState,
};

struct RunningService {
    handle: ServiceHandle,
    join_handle: JoinHandle<ServiceResult<()>>,
    spec: ServiceSpec,
}

pub struct ServiceManager {
    services: DashMap<String, RunningService>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: broadcast::Sender<Event>,
    shutdown_timeout: Duration,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            services: DashMap::new(),
            shutdown_tx,
            event_tx,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.event_tx.clone())
    }

    /// Receive every event published on the bus from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Spawn a service; ids are unique among running services
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        let service_id = spec.id.clone();

        if self.services.contains_key(&service_id) {
            return Err(ServiceError::DuplicateId(service_id));
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (state, state_rx) = watch::channel(ServiceState::Starting);
        let handle = ServiceHandle::new(service_id.clone(), stop_tx, state_rx);

        let ctx = ServiceContext::new(service_id.clone(), self.event_publisher());
        let channels = LoopChannels {
            stop_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            event_rx: self.event_tx.subscribe(),
        };

        let loop_spec = spec.clone();
        let join_handle =
            tokio::spawn(async move { run_service_loop(service, ctx, channels, state, loop_spec).await });

        self.services.insert(
            service_id,
            RunningService {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|s| s.handle.clone())
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.services
            .get(service_id)
            .map(|s| s.handle.is_running())
            .unwrap_or(false)
    }

    /// Publish an event to all subscribed services
    pub fn publish_event(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit(&self, event_type: impl Into<String>, source: impl Into<String>, data: serde_json::Value) {
        self.publish_event(Event::new(event_type, source, data));
    }

    /// Stop one service and wait for its task
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let running = self
            .services
            .remove(service_id)
            .map(|(_, v)| v)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        let _ = running.handle.shutdown().await;
        join_with_timeout(service_id, running.join_handle, running.spec.shutdown_timeout).await
    }

    /// Signal every service to stop and wait for all of them
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(services = self.services.len(), "Shutting down services");
        let _ = self.shutdown_tx.send(());

        let ids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        let mut result = Ok(());
        for id in ids {
            if let Some((_, running)) = self.services.remove(&id) {
                let timeout = running.spec.shutdown_timeout.min(self.shutdown_timeout);
                if let Err(e) = join_with_timeout(&id, running.join_handle, timeout).await {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

async fn join_with_timeout(
    service_id: &str,
    join_handle: JoinHandle<ServiceResult<()>>,
    timeout: Duration,
) -> ServiceResult<()> {
    match tokio::time::timeout(timeout, join_handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::error!(service_id, error = ?e, "Service task panicked");
            Err(ServiceError::Panicked(service_id.to_string()))
        }
        Err(_) => {
            tracing::warn!(service_id, "Service shutdown timed out");
            Err(ServiceError::StopTimeout(service_id.to_string()))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

struct LoopChannels {
    stop_rx: mpsc::Receiver<()>,
    shutdown_rx: broadcast::Receiver<()>,
    event_rx: broadcast::Receiver<Event>,
}

async fn run_service_loop<S: Service>(
    mut service: S,
    ctx: ServiceContext,
    mut channels: LoopChannels,
    state: watch::Sender<ServiceState>,
    spec: ServiceSpec,
) -> ServiceResult<()> {
    if let Err(e) = service.on_start(&ctx).await {
        tracing::error!(service_id = %ctx.service_id, error = %e, "Service failed to start");
        state.send_replace(ServiceState::Failed);
        return Err(e);
    }

    state.send_replace(ServiceState::Running);
    tracing::info!(service_id = %ctx.service_id, "Service started");

    // A tick that overruns its interval delays the next one instead of bursting
    let mut tick_timer = spec.tick_interval.map(|interval| {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    loop {
        tokio::select! {
            _ = channels.shutdown_rx.recv() => {
                tracing::debug!(service_id = %ctx.service_id, "Received global shutdown signal");
                break;
            }

            Some(()) = channels.stop_rx.recv() => {
                tracing::debug!(service_id = %ctx.service_id, "Received stop request");
                break;
            }

            Ok(event) = channels.event_rx.recv() => {
                if spec.subscriptions.iter().any(|p| event.matches(p)) {
                    if let Err(e) = service.on_event(&ctx, event).await {
                        tracing::warn!(service_id = %ctx.service_id, error = %e, "Error handling broadcast event");
                    }
                }
            }

            _ = async {
                match tick_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending::<tokio::time::Instant>().await,
                }
            } => {
                if let Err(e) = service.on_tick(&ctx).await {
                    tracing::warn!(service_id = %ctx.service_id, error = %e, "Error during tick");
                }
            }
        }
    }

    state.send_replace(ServiceState::Stopping);
    tracing::debug!(service_id = %ctx.service_id, "Service stopping");

    match tokio::time::timeout(spec.shutdown_timeout, service.on_stop(&ctx)).await {
        Ok(Ok(())) => {
            state.send_replace(ServiceState::Stopped);
            tracing::info!(service_id = %ctx.service_id, "Service stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            state.send_replace(ServiceState::Failed);
            tracing::error!(service_id = %ctx.service_id, error = %e, "Service stop failed");
            Err(e)
        }
        Err(_) => {
            state.send_replace(ServiceState::Failed);
            tracing::error!(service_id = %ctx.service_id, "Service stop timed out");
            Err(ServiceError::StopTimeout(ctx.service_id.clone()))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        events: AtomicUsize,
        ticks: AtomicUsize,
    }

    struct CountingService {
        id: String,
        tick_interval: Option<Duration>,
        counters: Arc<Counters>,
    }

    impl CountingService {
        fn new(id: &str) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let service = Self {
                id: id.to_string(),
                tick_interval: None,
                counters: Arc::clone(&counters),
            };
            (service, counters)
        }
    }

    #[async_trait::async_trait]
    impl Service for CountingService {
        fn spec(&self) -> ServiceSpec {
            let spec = ServiceSpec::new(&self.id, "Counting Service").subscribe("cycle/*");
            match self.tick_interval {
                Some(interval) => spec.with_tick_interval(interval),
                None => spec,
            }
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
            self.counters.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop_service() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("counting");

        let handle = manager.spawn(service).await.unwrap();
        handle.started().await.unwrap();
        assert_eq!(handle.state(), ServiceState::Running);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);

        manager.stop("counting").await.unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stopped().await, ServiceState::Stopped);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_event_routing_by_pattern() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("listener");
        let handle = manager.spawn(service).await.unwrap();
        handle.started().await.unwrap();

        manager.emit("cycle/completed", "test", serde_json::json!({}));
        manager.emit("health/written", "test", serde_json::json!({}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counters.events.load(Ordering::SeqCst), 1);
        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_interval() {
        let manager = ServiceManager::new();
        let (mut service, counters) = CountingService::new("ticker");
        service.tick_interval = Some(Duration::from_secs(60));

        let handle = manager.spawn(service).await.unwrap();
        handle.started().await.unwrap();

        // the first tick fires immediately, then one per interval
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);

        handle.shutdown().await.unwrap();
        assert_eq!(handle.stopped().await, ServiceState::Stopped);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    struct FailingStart;

    #[async_trait::async_trait]
    impl Service for FailingStart {
        fn spec(&self) -> ServiceSpec {
            ServiceSpec::new("controller", "Failing Controller")
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Err(ServiceError::Failed("no adapters".into()))
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_start_is_reported() {
        let manager = ServiceManager::new();
        let handle = manager.spawn(FailingStart).await.unwrap();

        assert!(handle.started().await.is_err());
        assert_eq!(handle.stopped().await, ServiceState::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = ServiceManager::new();
        let (first, _) = CountingService::new("controller");
        let (second, _) = CountingService::new("controller");

        manager.spawn(first).await.unwrap();
        let result = manager.spawn(second).await;
        assert!(matches!(result, Err(ServiceError::DuplicateId(_))));

        manager.shutdown_all().await.unwrap();
    }
}
