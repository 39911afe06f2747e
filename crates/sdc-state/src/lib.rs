//! ---
//! sdc_section: "03-controller-state"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Controller state, send queue and service projection."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! Per-controller protocol state.
//!
//! Every device is represented by one [`Controller`] holding its register
//! map, the pending-write send queue, authentication material (nonce and
//! sequence tracking) and statistics. Controllers live in the shared
//! [`ControllerRegistry`] and are mutated only under their own lock.

pub mod controller;
pub mod registry;
pub mod service;
pub mod stats;

pub use controller::{
    field_json, AppliedUpdate, Controller, PendingWrite, RegisterEntry, RegisterReading,
    StateError, TemporalPolicy,
};
pub use registry::{ControllerRegistry, SharedController};
pub use service::{ServiceProjection, ServiceReading};
pub use stats::ControllerStats;
