//! File Interface Adapter
//!
//! Serves the `file` interface from local files: input data from a CSV or
//! JSON file, static data from a JSON file, and results written to a JSON
//! results file. Outputs written in earlier cycles are read back from the
//! results file.
//!
//! A read looks in the input file, then the static data file, then the
//! results file, and uses the first one containing the attribute.

mod results;
mod source;

pub use results::*;
pub use source::*;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use meridian_runtime::{AdapterError, ConfigError, InterfaceAdapter, PointWrite};
use meridian_types::{InterfaceKind, PointAddress, Reading, Unit, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FileAdapterError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected file layout: {0}")]
    Layout(String),

    #[error("CSV file has no Time column")]
    MissingTimeColumn,

    #[error("cannot parse time '{0}'")]
    InvalidTime(String),

    #[error("unsupported file type: {0} (expected .csv or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("no value for {0} in any data file")]
    NotFound(String),
}

impl From<FileAdapterError> for ConfigError {
    fn from(e: FileAdapterError) -> Self {
        ConfigError::Load(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FileSettings {
    /// CSV or JSON input data
    pub input_file: Option<PathBuf>,
    /// JSON static data
    pub static_file: Option<PathBuf>,
    pub results_file: PathBuf,
    /// chrono format for timestamps without offset
    pub time_format: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

pub struct FileAdapter {
    settings: FileSettings,
    /// Loaded on first use, then replaced after every successful save
    results: Mutex<Option<ResultsDocument>>,
}

impl FileAdapter {
    /// Check file types up front; the files themselves are read per call
    pub fn new(settings: FileSettings) -> Result<Self, FileAdapterError> {
        if let Some(path) = &settings.input_file {
            FileFormat::of(path)?;
        }
        if let Some(path) = &settings.static_file {
            if FileFormat::of(path)? != FileFormat::Json {
                return Err(FileAdapterError::UnsupportedFormat(path.clone()));
            }
        }

        Ok(Self {
            settings,
            results: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &FileSettings {
        &self.settings
    }

    /// Records for `address` from the first data file that has any, plus
    /// the first error met on the way
    async fn data_records(&self, address: &PointAddress) -> (Vec<Record>, Option<FileAdapterError>) {
        let sources = [
            (&self.settings.input_file, JsonSection::InputData),
            (&self.settings.static_file, JsonSection::StaticData),
        ];

        let mut first_error = None;
        for (path, section) in sources {
            let Some(path) = path else { continue };
            match load(path, section, &self.settings.time_format).await {
                Ok(records) => {
                    let matching: Vec<Record> = records.into_iter().filter(|r| r.matches(address)).collect();
                    if !matching.is_empty() {
                        debug!(address = %address, path = %path.display(), count = matching.len(), "Read from data file");
                        return (matching, None);
                    }
                }
                Err(e) => {
                    debug!(address = %address, path = %path.display(), error = %e, "Data file unavailable");
                    first_error.get_or_insert(e);
                }
            }
        }
        (Vec::new(), first_error)
    }

    async fn with_results<T>(
        &self,
        f: impl FnOnce(&mut ResultsDocument) -> T,
    ) -> Result<T, FileAdapterError> {
        let mut guard = self.results.lock().await;
        let document = match guard.take() {
            Some(document) => document,
            None => ResultsDocument::load_or_reset(&self.settings.results_file).await?,
        };
        Ok(f(guard.insert(document)))
    }

    async fn current(&self, address: &PointAddress) -> Result<Reading, FileAdapterError> {
        let (records, error) = self.data_records(address).await;
        if let Some(newest) = records.iter().max_by_key(|r| r.time) {
            return Ok(newest.to_reading(Utc::now()));
        }

        match self.with_results(|doc| doc.latest(address)).await? {
            Some(reading) => Ok(reading),
            None => Err(error.unwrap_or_else(|| FileAdapterError::NotFound(address.to_string()))),
        }
    }

    async fn range(
        &self,
        address: &PointAddress,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, FileAdapterError> {
        let (records, error) = self.data_records(address).await;
        if records.is_empty() {
            let readings = self.with_results(|doc| doc.range(address, start, end)).await?;
            return match error {
                Some(e) if readings.is_empty() => Err(e),
                _ => Ok(readings),
            };
        }

        let mut readings: Vec<Reading> = records
            .iter()
            .filter(|r| r.time.is_some_and(|t| t >= start && t <= end))
            .map(|r| r.to_reading(end))
            .collect();
        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }

    /// Record a batch on a copy of the results document and keep the copy
    /// only once it is saved
    async fn write(&self, writes: &[PointWrite]) -> Result<(), FileAdapterError> {
        let mut guard = self.results.lock().await;
        let mut document = match guard.as_ref() {
            Some(document) => document.clone(),
            None => ResultsDocument::load_or_reset(&self.settings.results_file).await?,
        };
        for write in writes {
            document.record(&write.address, write.value.clone(), write.unit, write.timestamp);
        }
        document.save(&self.settings.results_file).await?;

        debug!(path = %self.settings.results_file.display(), count = writes.len(), "Results saved");
        *guard = Some(document);
        Ok(())
    }
}

#[async_trait]
impl InterfaceAdapter for FileAdapter {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::File
    }

    async fn fetch_current(&self, address: &PointAddress) -> Result<Reading, AdapterError> {
        self.current(address)
            .await
            .map_err(|e| AdapterError::unavailable(address, e.to_string()))
    }

    async fn fetch_range(
        &self,
        address: &PointAddress,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, AdapterError> {
        self.range(address, start, end)
            .await
            .map_err(|e| AdapterError::unavailable(address, e.to_string()))
    }

    async fn write_value(
        &self,
        address: &PointAddress,
        value: &Value,
        unit: Option<Unit>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AdapterError> {
        let write = PointWrite {
            address: address.clone(),
            value: value.clone(),
            unit,
            timestamp,
        };
        self.write(std::slice::from_ref(&write))
            .await
            .map_err(|e| AdapterError::rejected(address, e.to_string()))
    }

    async fn write_batch(&self, writes: &[PointWrite]) -> Vec<Result<(), AdapterError>> {
        match self.write(writes).await {
            Ok(()) => writes.iter().map(|_| Ok(())).collect(),
            Err(e) => {
                let reason = e.to_string();
                writes
                    .iter()
                    .map(|w| Err(AdapterError::rejected(&w.address, reason.clone())))
                    .collect()
            }
        }
    }
}

impl std::fmt::Debug for FileAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAdapter")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, input: Option<&str>, statics: Option<&str>) -> FileSettings {
        FileSettings {
            input_file: input.map(|name| dir.path().join(name)),
            static_file: statics.map(|name| dir.path().join(name)),
            results_file: dir.path().join("results").join("results.json"),
            time_format: "%Y-%m-%d %H:%M:%S".into(),
        }
    }

    fn address(entity: &str, attribute: &str) -> PointAddress {
        PointAddress::new(entity, attribute, InterfaceKind::File)
    }

    #[test]
    fn test_rejects_unsupported_files() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileAdapter::new(settings(&dir, Some("input.xlsx"), None)),
            Err(FileAdapterError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            FileAdapter::new(settings(&dir, None, Some("static.csv"))),
            Err(FileAdapterError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_csv_current_and_range() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("input.csv"),
            "Time;T1\n2024-05-01 10:00:00;50,0\n2024-05-01 10:30:00;52,5\n2024-05-01 11:00:00;55,0\n",
        )
        .unwrap();
        let adapter = FileAdapter::new(settings(&dir, Some("input.csv"), None)).unwrap();

        let current = adapter.fetch_current(&address("tank1", "T1")).await.unwrap();
        assert_eq!(current.value, Value::Float(55.0));
        assert_eq!(current.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        let range = adapter.fetch_range(&address("tank1", "T1"), start, end).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].value, Value::Float(52.5));
    }

    #[tokio::test]
    async fn test_static_json_and_missing_attribute() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("static.json"),
            r#"{"staticdata": [{"id": "params", "attributes": [{"id": "setpoint", "value": 60, "unit": "CEL"}]}]}"#,
        )
        .unwrap();
        let adapter = FileAdapter::new(settings(&dir, None, Some("static.json"))).unwrap();

        let reading = adapter.fetch_current(&address("params", "setpoint")).await.unwrap();
        assert_eq!(reading.value, Value::Int(60));
        assert_eq!(reading.unit, Some(Unit::Celsius));

        let err = adapter.fetch_current(&address("params", "absent")).await.unwrap_err();
        assert!(matches!(err, AdapterError::SourceUnavailable { .. }));
        let wrong_entity = adapter.fetch_current(&address("other", "setpoint")).await;
        assert!(wrong_entity.is_err());
    }

    #[tokio::test]
    async fn test_missing_input_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(settings(&dir, Some("absent.csv"), None)).unwrap();

        let err = adapter.fetch_current(&address("tank1", "T1")).await.unwrap_err();
        assert!(matches!(err, AdapterError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_written_outputs_read_back() {
        let dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(settings(&dir, None, None)).unwrap();
        let pump = address("pump1", "command");
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();

        adapter.write_value(&pump, &Value::Int(1), None, t0).await.unwrap();
        adapter
            .write_value(&pump, &Value::Int(0), Some(Unit::Percent), t1)
            .await
            .unwrap();

        let latest = adapter.fetch_current(&pump).await.unwrap();
        assert_eq!(latest.value, Value::Int(0));
        assert_eq!(latest.unit, Some(Unit::Percent));

        // A fresh adapter sees what the first one persisted
        let reopened = FileAdapter::new(adapter.settings().clone()).unwrap();
        assert_eq!(reopened.fetch_current(&pump).await.unwrap().timestamp, t1);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_results() {
        let dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(settings(&dir, None, None)).unwrap();
        let path = adapter.settings().results_file.clone();
        let pump = address("pump1", "command");
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 0).unwrap();

        adapter.write_value(&pump, &Value::Int(1), None, t0).await.unwrap();

        // a directory in place of the file makes the next save fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let err = adapter.write_value(&pump, &Value::Int(0), None, t1).await.unwrap_err();
        assert!(matches!(err, AdapterError::WriteRejected { .. }));
        assert_eq!(adapter.fetch_current(&pump).await.unwrap().timestamp, t0);

        std::fs::remove_dir(&path).unwrap();
        adapter.write_value(&pump, &Value::Int(1), None, t2).await.unwrap();
        let saved = ResultsDocument::load(&path).await.unwrap();
        let times: Vec<_> = saved.range(&pump, t0, t2).iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![t0, t2]);
    }

    #[tokio::test]
    async fn test_batch_saved_as_one_document() {
        let dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(settings(&dir, None, None)).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let writes: Vec<PointWrite> = ["command", "setpoint"]
            .into_iter()
            .enumerate()
            .map(|(i, attribute)| PointWrite {
                address: address("pump1", attribute),
                value: Value::Int(i as i64),
                unit: None,
                timestamp: now,
            })
            .collect();

        let results = adapter.write_batch(&writes).await;
        assert!(results.iter().all(Result::is_ok));

        let saved = ResultsDocument::load(&adapter.settings().results_file).await.unwrap();
        assert_eq!(saved.latest(&address("pump1", "setpoint")).unwrap().value, Value::Int(1));

        // a batch that cannot be saved fails every write in it
        std::fs::remove_file(&adapter.settings().results_file).unwrap();
        std::fs::create_dir(&adapter.settings().results_file).unwrap();
        let results = adapter.write_batch(&writes).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_err));
    }
}
