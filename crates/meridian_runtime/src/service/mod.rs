//! Service Lifecycle Management
//!
//! Long-running parts of the orchestrator (the cycle driver, the health
//! writer) run as services under a [`ServiceManager`]. A service gets a
//! periodic tick, events from the shared bus matching its subscriptions,
//! and start/stop hooks.
//!
//! # Lifecycle
//!
//! - `on_start`: called once before the first tick; an error keeps the service from running
//! - `on_tick`: called every `tick_interval` (first tick fires immediately)
//! - `on_event`: called for bus events matching a subscription pattern
//! - `on_stop`: called on shutdown, bounded by `shutdown_timeout`

mod event;
mod handle;
mod manager;

pub use event::*;
pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("service id '{0}' is already in use")]
    DuplicateId(String),

    #[error("service '{0}' is not running")]
    NotRunning(String),

    #[error("service '{0}' did not stop in time")]
    StopTimeout(String),

    #[error("service '{0}' panicked")]
    Panicked(String),

    /// No receiver is subscribed to the event bus
    #[error("event dropped, the bus has no receivers")]
    NoReceivers,

    #[error("{0}")]
    Failed(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    pub tick_interval: Option<Duration>,

    /// Event patterns, e.g. `"cycle/completed"`, `"cycle/*"` or `"*"`
    pub subscriptions: Vec<String>,

    /// Timeout for `on_stop`
    pub shutdown_timeout: Duration,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tick_interval: None,
            subscriptions: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to service lifecycle methods
pub struct ServiceContext {
    pub service_id: String,
    event_publisher: EventPublisher,
}

impl ServiceContext {
    pub fn new(service_id: String, event_publisher: EventPublisher) -> Self {
        Self {
            service_id,
            event_publisher,
        }
    }

    /// Publish an event to all subscribed services
    pub fn publish(&self, event: Event) -> ServiceResult<()> {
        self.event_publisher.publish(event)
    }

    /// Create and publish an event sourced from this service
    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) -> ServiceResult<()> {
        self.publish(Event::new(event_type, &self.service_id, data))
    }

    /// Like [`emit`](Self::emit) with a typed payload
    pub fn emit_data<T: Serialize>(&self, event_type: impl Into<String>, data: &T) -> ServiceResult<()> {
        let event = Event::with_data(event_type, &self.service_id, data)
            .map_err(|e| ServiceError::Failed(format!("cannot encode event payload: {e}")))?;
        self.publish(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// The service is considered stopped even if this returns an error
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}
