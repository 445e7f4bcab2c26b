//! Meridian Types - Core data definitions for the orchestration runtime
//!
//! This crate contains the pure data structures that flow through a cycle:
//! values, units, granularities, interface tags, readings, the per-cycle
//! input bundle and the calculation result set. It performs no I/O.

mod interface;
mod models;
mod units;
mod value;

pub use interface::*;
pub use models::*;
pub use units::*;
pub use value::*;
