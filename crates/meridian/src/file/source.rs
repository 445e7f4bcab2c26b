// File Sources - Parses CSV and JSON data files into flat records
//
// CSV files carry one `Time` column and one column per attribute, with `;`
// as separator and `,` as decimal mark. JSON files list entities with their
// attributes, optionally wrapped in an object under `inputdata` or
// `staticdata`.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use meridian_types::{PointAddress, Reading, Unit, Value};

use super::FileAdapterError;

const TIME_COLUMN: &str = "Time";

/// One value found in a data file
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// `None` for CSV rows, which carry no entity
    pub entity: Option<String>,
    pub attribute: String,
    pub value: Value,
    pub unit: Option<Unit>,
    pub time: Option<DateTime<Utc>>,
}

impl Record {
    pub fn matches(&self, address: &PointAddress) -> bool {
        self.attribute == address.transport_attribute()
            && self.entity.as_deref().is_none_or(|e| e == address.entity)
    }

    pub fn to_reading(&self, fallback: DateTime<Utc>) -> Reading {
        Reading {
            value: self.value.clone(),
            unit: self.unit,
            timestamp: self.time.unwrap_or(fallback),
        }
    }
}

/// Which wrapper key a JSON file is read under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonSection {
    InputData,
    StaticData,
}

impl JsonSection {
    fn key(&self) -> &'static str {
        match self {
            JsonSection::InputData => "inputdata",
            JsonSection::StaticData => "staticdata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    pub fn of(path: &Path) -> Result<Self, FileAdapterError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("csv") => Ok(FileFormat::Csv),
            Some("json") => Ok(FileFormat::Json),
            _ => Err(FileAdapterError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Read every record of a data file
pub async fn load(path: &Path, section: JsonSection, time_format: &str) -> Result<Vec<Record>, FileAdapterError> {
    let format = FileFormat::of(path)?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| FileAdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    match format {
        FileFormat::Csv => parse_csv(&bytes, time_format),
        FileFormat::Json => parse_json(&bytes, section, time_format),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CSV
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_csv(bytes: &[u8], time_format: &str) -> Result<Vec<Record>, FileAdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let time_index = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(TIME_COLUMN))
        .ok_or(FileAdapterError::MissingTimeColumn)?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let raw_time = row.get(time_index).unwrap_or_default();
        let time = parse_time(raw_time, time_format)?;

        for (index, field) in row.iter().enumerate() {
            if index == time_index {
                continue;
            }
            let Some(attribute) = headers.get(index) else {
                continue;
            };
            records.push(Record {
                entity: None,
                attribute: attribute.to_string(),
                value: parse_csv_value(field),
                unit: None,
                time: Some(time),
            });
        }
    }
    Ok(records)
}

/// Number with `,` or `.` decimal mark, boolean, empty, or text
fn parse_csv_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = field.replace(',', ".").parse::<f64>() {
        return Value::Float(f);
    }
    match field.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(field.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EntityEntry {
    id: String,
    #[serde(default)]
    attributes: Vec<AttributeEntry>,
}

#[derive(Debug, Deserialize)]
struct AttributeEntry {
    id: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

pub fn parse_json(bytes: &[u8], section: JsonSection, time_format: &str) -> Result<Vec<Record>, FileAdapterError> {
    let document: serde_json::Value = serde_json::from_slice(bytes)?;
    let entities = match document {
        serde_json::Value::Array(_) => document,
        serde_json::Value::Object(mut map) => map
            .remove(section.key())
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        other => {
            return Err(FileAdapterError::Layout(format!(
                "expected a list or an object, found {}",
                json_kind(&other)
            )));
        }
    };
    let entities: Vec<EntityEntry> = serde_json::from_value(entities)?;

    let mut records = Vec::new();
    for entity in entities {
        for attribute in entity.attributes {
            let unit = match attribute.unit.as_deref() {
                Some(code) => match code.parse::<Unit>() {
                    Ok(unit) => Some(unit),
                    Err(e) => {
                        warn!(entity = %entity.id, attribute = %attribute.id, error = %e, "Ignoring unit in data file");
                        None
                    }
                },
                None => None,
            };
            let time = attribute
                .time
                .as_deref()
                .map(|t| parse_time(t, time_format))
                .transpose()?;

            records.push(Record {
                entity: Some(entity.id.clone()),
                attribute: attribute.id,
                value: attribute.value,
                unit,
                time,
            });
        }
    }
    Ok(records)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "an object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Time
// ─────────────────────────────────────────────────────────────────────────────

/// RFC 3339 with offset, else `time_format` or ISO 8601 without offset as UTC
pub fn parse_time(raw: &str, time_format: &str) -> Result<DateTime<Utc>, FileAdapterError> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Ok(time.with_timezone(&Utc));
    }

    [time_format, "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| FileAdapterError::InvalidTime(raw.to_string()))
}
