//! Shared types.
//!
//! - [`config`] - Configuration loaded at startup

pub mod config;

pub use config::{ConfigError, GuardConfig};
