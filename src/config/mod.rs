//! # Configuration Management
//!
//! Environment-driven configuration for the warden host. Each section has a
//! `from_env` constructor reading `WARDEN_*` variables and falling back to
//! defaults; [`AppConfig::validate`] runs field and cross-field checks.

pub mod settings;

pub use settings::{AppConfig, LeaseConfig, ObservabilityConfig, PluginConfig};
