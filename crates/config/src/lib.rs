#![warn(missing_docs)]

//! # Lattice Config
//!
//! Scheduler configuration: defaults per the control-plane contract, an
//! optional TOML file, and `LATTICE_*` environment overrides applied on top.

mod config;

pub use config::{
    AckRetryConfig, ConfigError, DispatchConfig, ReconnectConfig, ResourceConfig, SchedulerConfig,
    ServerConfig, SessionConfig,
};
