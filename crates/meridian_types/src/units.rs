//! Physical units and time granularities
//!
//! Units are carried opaquely: they are validated against a closed set of
//! symbols and compared for equality, never converted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized unit symbol: {0}")]
pub struct UnknownUnit(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized granularity: {0}")]
pub struct UnknownGranularity(pub String);

// ─────────────────────────────────────────────────────────────────────────────
// Unit
// ─────────────────────────────────────────────────────────────────────────────

/// A recognized unit of measurement, identified by its code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Second,
    Minute,
    Hour,
    Celsius,
    Kelvin,
    Litre,
    CubicMetre,
    CubicMetrePerHour,
    Watt,
    Kilowatt,
    WattHour,
    KilowattHour,
    Percent,
    Bar,
}

impl Unit {
    pub const ALL: [Unit; 14] = [
        Unit::Second,
        Unit::Minute,
        Unit::Hour,
        Unit::Celsius,
        Unit::Kelvin,
        Unit::Litre,
        Unit::CubicMetre,
        Unit::CubicMetrePerHour,
        Unit::Watt,
        Unit::Kilowatt,
        Unit::WattHour,
        Unit::KilowattHour,
        Unit::Percent,
        Unit::Bar,
    ];

    /// Configuration code (`CEL`, `KWH`, ...)
    pub fn code(&self) -> &'static str {
        match self {
            Unit::Second => "SEC",
            Unit::Minute => "MIN",
            Unit::Hour => "HUR",
            Unit::Celsius => "CEL",
            Unit::Kelvin => "KEL",
            Unit::Litre => "LIT",
            Unit::CubicMetre => "MTQ",
            Unit::CubicMetrePerHour => "MQH",
            Unit::Watt => "WTT",
            Unit::Kilowatt => "KWT",
            Unit::WattHour => "WHR",
            Unit::KilowattHour => "KWH",
            Unit::Percent => "P1",
            Unit::Bar => "BAR",
        }
    }

    /// Human readable symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Second => "s",
            Unit::Minute => "min",
            Unit::Hour => "h",
            Unit::Celsius => "°C",
            Unit::Kelvin => "K",
            Unit::Litre => "l",
            Unit::CubicMetre => "m³",
            Unit::CubicMetrePerHour => "m³/h",
            Unit::Watt => "W",
            Unit::Kilowatt => "kW",
            Unit::WattHour => "Wh",
            Unit::KilowattHour => "kWh",
            Unit::Percent => "%",
            Unit::Bar => "bar",
        }
    }

    /// Whether `value` lies in this unit's value domain
    ///
    /// Every recognized unit measures a real quantity, so numbers, numeric
    /// sequences and series qualify. `Null` is accepted as "no value".
    pub fn is_compatible(&self, value: &Value) -> bool {
        value.is_null() || value.is_numeric()
    }
}

impl FromStr for Unit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Unit::ALL
            .iter()
            .copied()
            .find(|u| u.code().eq_ignore_ascii_case(trimmed) || u.symbol() == trimmed)
            .ok_or_else(|| UnknownUnit(s.to_string()))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for Unit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for Unit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Granularity
// ─────────────────────────────────────────────────────────────────────────────

/// Named time-window size used for cycle intervals and range queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    /// Fixed 30 days, independent of the calendar
    Month,
}

impl Granularity {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    pub fn seconds(&self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
            Granularity::Month => 30 * 86_400,
        }
    }

    /// `count` consecutive windows of this granularity
    pub fn span(&self, count: u32) -> Duration {
        Duration::from_secs(self.seconds() * u64::from(count))
    }
}

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            _ => Err(UnknownGranularity(s.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_parsing() {
        assert_eq!("CEL".parse::<Unit>().unwrap(), Unit::Celsius);
        assert_eq!("kwh".parse::<Unit>().unwrap(), Unit::KilowattHour);
        assert_eq!("°C".parse::<Unit>().unwrap(), Unit::Celsius);
        assert!("furlong".parse::<Unit>().is_err());
    }

    #[test]
    fn test_unit_serde_uses_code() {
        let json = serde_json::to_string(&Unit::CubicMetrePerHour).unwrap();
        assert_eq!(json, "\"MQH\"");
        let back: Unit = serde_json::from_str("\"WTT\"").unwrap();
        assert_eq!(back, Unit::Watt);
    }

    #[test]
    fn test_unit_value_domain() {
        assert!(Unit::Celsius.is_compatible(&Value::Float(21.0)));
        assert!(Unit::Celsius.is_compatible(&Value::Null));
        assert!(!Unit::Celsius.is_compatible(&Value::from("warm")));
        assert!(!Unit::Watt.is_compatible(&Value::Bool(true)));
    }

    #[test]
    fn test_month_is_thirty_days() {
        assert_eq!(
            Granularity::Month.duration(),
            Duration::from_secs(30 * 24 * 3600)
        );
        assert_eq!(Granularity::Hour.span(3), Duration::from_secs(3 * 3600));
    }

    #[test]
    fn test_granularity_serde() {
        let g: Granularity = serde_json::from_str("\"minute\"").unwrap();
        assert_eq!(g, Granularity::Minute);
        assert_eq!("Day".parse::<Granularity>().unwrap(), Granularity::Day);
        assert!("week".parse::<Granularity>().is_err());
    }
}
