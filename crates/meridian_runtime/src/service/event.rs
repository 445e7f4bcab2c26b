//! Service Events
//!
//! Services talk to each other through a broadcast bus of typed-by-name
//! events (`cycle/completed`, `cycle/failed`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wildmatch::WildMatch;

use super::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Slash separated event name, e.g. `cycle/completed`
    pub event_type: String,

    /// Service that emitted the event
    pub source: String,

    pub data: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Build an event whose payload is `data` serialized to JSON
    pub fn with_data<T: Serialize>(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, source, serde_json::to_value(data)?))
    }

    /// Glob match against a subscription pattern (`*` and `?` wildcards)
    pub fn matches(&self, pattern: &str) -> bool {
        pattern == "*" || WildMatch::new(pattern).matches(&self.event_type)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable sending side of the event bus
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(tx: broadcast::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Publish an event; fails only when nobody is subscribed
    pub fn publish(&self, event: Event) -> Result<(), ServiceError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| ServiceError::NoReceivers)
    }
}
