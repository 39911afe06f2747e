//! ---
//! sdc_section: "01-shared-runtime"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Shared primitives and utilities for the collector runtime."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! Core shared primitives for the SDC collector workspace.
//! This crate exposes configuration loading, logging bootstrap and
//! wall-clock utilities consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    CollectorConfig, ControllerSetupConfig, LoggingConfig, MetricsConfig, ProtocolConfig,
    ServiceEntryConfig, ServiceGroupConfig, UdpConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::unix_now;
