//! Application Services
//!
//! - `controller`: runs calculation and calibration cycles on schedule
//! - `health`: keeps the health file current from cycle events

pub mod controller;
pub mod health;

pub use controller::{ControllerService, CycleSummary};
pub use health::{HealthError, HealthService, check_health};
