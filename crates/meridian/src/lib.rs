//! Meridian - Config-driven data orchestration
//!
//! This crate provides the application around `meridian_runtime`:
//! - Settings and configuration loading via figment
//! - The file interface adapter
//! - Built-in components (two-point controller, moving average)
//! - Controller and health services

// Re-export core crates
pub use meridian_runtime;
pub use meridian_types;

// Built-in component types
pub mod components;

// File interface adapter
pub mod file;

// Settings, configuration and wiring
pub mod project;

// Long-running services
pub mod services;
