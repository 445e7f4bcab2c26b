use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport an entity attribute is reachable through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Context-state API
    #[serde(alias = "fiware")]
    Context,
    /// Time-series database
    Timeseries,
    Mqtt,
    File,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 4] = [
        InterfaceKind::Context,
        InterfaceKind::Timeseries,
        InterfaceKind::Mqtt,
        InterfaceKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Context => "context",
            InterfaceKind::Timeseries => "timeseries",
            InterfaceKind::Mqtt => "mqtt",
            InterfaceKind::File => "file",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
