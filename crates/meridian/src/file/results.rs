// Results File - JSON document of written outputs
//
// Layout: entity -> timestamp -> attribute -> { value, unit }. The newest
// entry of an attribute is what later cycles read back as its last output.
// Only the newest HISTORY_LIMIT entries of each attribute are kept.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use meridian_types::{PointAddress, Reading, Unit, Value};

use super::FileAdapterError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

/// Entries kept per attribute
pub const HISTORY_LIMIT: usize = 96;

type Timeline = BTreeMap<DateTime<Utc>, BTreeMap<String, ResultEntry>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultsDocument {
    entities: BTreeMap<String, Timeline>,
}

impl ResultsDocument {
    /// Load an existing document; a missing file is an empty document
    pub async fn load(path: &Path) -> Result<Self, FileAdapterError> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Self::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(FileAdapterError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load, starting over when the existing file cannot be parsed
    pub async fn load_or_reset(path: &Path) -> Result<Self, FileAdapterError> {
        match Self::load(path).await {
            Err(FileAdapterError::Json(e)) => {
                warn!(path = %path.display(), error = %e, "Results file is not valid JSON, starting a new one");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), FileAdapterError> {
        let io_error = |source| FileAdapterError::Io {
            path: PathBuf::from(path),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await.map_err(io_error)
    }

    /// Add an entry, dropping the attribute's entries beyond [`HISTORY_LIMIT`]
    pub fn record(&mut self, address: &PointAddress, value: Value, unit: Option<Unit>, timestamp: DateTime<Utc>) {
        let attribute = address.transport_attribute();
        let timeline = self.entities.entry(address.entity.clone()).or_default();
        timeline
            .entry(timestamp)
            .or_default()
            .insert(attribute.to_string(), ResultEntry { value, unit });

        let stale: Vec<DateTime<Utc>> = timeline
            .iter()
            .rev()
            .filter(|(_, attributes)| attributes.contains_key(attribute))
            .skip(HISTORY_LIMIT)
            .map(|(time, _)| *time)
            .collect();
        for time in stale {
            if let Some(attributes) = timeline.get_mut(&time) {
                attributes.remove(attribute);
                if attributes.is_empty() {
                    timeline.remove(&time);
                }
            }
        }
    }

    /// Newest entry written for the address
    pub fn latest(&self, address: &PointAddress) -> Option<Reading> {
        let attribute = address.transport_attribute();
        self.entities
            .get(&address.entity)?
            .iter()
            .rev()
            .find_map(|(time, attributes)| {
                attributes.get(attribute).map(|entry| Reading {
                    value: entry.value.clone(),
                    unit: entry.unit,
                    timestamp: *time,
                })
            })
    }

    /// Entries within `start..=end`, oldest first
    pub fn range(&self, address: &PointAddress, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Reading> {
        let attribute = address.transport_attribute();
        let Some(timeline) = self.entities.get(&address.entity) else {
            return Vec::new();
        };
        timeline
            .range(start..=end)
            .filter_map(|(time, attributes)| {
                attributes.get(attribute).map(|entry| Reading {
                    value: entry.value.clone(),
                    unit: entry.unit,
                    timestamp: *time,
                })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
