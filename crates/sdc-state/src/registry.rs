//! ---
//! sdc_section: "03-controller-state"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Controller state, send queue and service projection."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use sdc_common::config::ControllerSetupConfig;
use sdc_common::time::unix_now;
use tracing::{debug, info};

use crate::controller::Controller;

/// Handle to one controller. The mutex serialises datagram processing for
/// that controller id; distinct controllers proceed independently.
pub type SharedController = Arc<Mutex<Controller>>;

/// Shared find-or-create collection of controllers, owned by the process
/// composition root and passed explicitly into the receiver.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    inner: RwLock<HashMap<String, SharedController>>,
}

impl ControllerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with static setup from configuration.
    pub fn from_setup(setups: &IndexMap<String, ControllerSetupConfig>) -> Self {
        let registry = Self::new();
        for (controller_id, setup) in setups {
            let handle = registry.find_or_create(controller_id);
            let mut controller = handle.lock();
            controller.set_setup(setup.clone());
            debug!(
                controller = %controller_id,
                secured = setup.secret_key.is_some(),
                key_fingerprint = setup.key_fingerprint().as_deref().unwrap_or(""),
                "controller setup applied"
            );
        }
        registry
    }

    /// Look up a controller, creating it on first reference.
    pub fn find_or_create(&self, controller_id: &str) -> SharedController {
        if let Some(existing) = self.lookup(controller_id) {
            return existing;
        }
        let mut inner = self.inner.write();
        inner
            .entry(controller_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Controller::new(controller_id, unix_now()))))
            .clone()
    }

    /// Look up a controller without creating it.
    pub fn lookup(&self, controller_id: &str) -> Option<SharedController> {
        self.inner.read().get(controller_id).cloned()
    }

    /// Remove a controller on administrative request. Returns whether it
    /// existed.
    pub fn remove(&self, controller_id: &str) -> bool {
        let removed = self.inner.write().remove(controller_id).is_some();
        if removed {
            info!(controller = %controller_id, "controller removed");
        }
        removed
    }

    /// Ids of all known controllers.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of known controllers.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
