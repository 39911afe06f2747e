//! ---
//! sdc_section: "03-controller-state"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Controller state, send queue and service projection."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::collections::HashSet;

use sdc_common::config::ServiceGroupConfig;
use sdc_proto::{FieldValue, Scalar};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::controller::Controller;

/// One projected service row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceReading {
    /// Register the measurement was read from.
    pub key: String,
    /// Status register value.
    pub status: u8,
    /// Scaled or stringified measurement.
    pub value: JsonValue,
    /// Human-readable service name from the servicegroup table.
    pub name: String,
    /// Display unit, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Read-only service view of one controller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceProjection {
    /// Controller the projection belongs to.
    pub controller: String,
    /// Projected rows; incomplete entries are silently omitted.
    pub services: Vec<ServiceReading>,
    /// Receive time of the last accepted message, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl ServiceProjection {
    /// Render as an API payload.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

impl Controller {
    /// Project raw registers into the external service view.
    ///
    /// Pure and read-only: entries with a missing status or value register
    /// are skipped, never reported as errors.
    pub fn project_service(&self, group: &ServiceGroupConfig) -> ServiceProjection {
        self.project(group, None)
    }

    /// Like [`Controller::project_service`], restricted to services touched
    /// by the last accepted message.
    pub fn project_service_recent(&self, group: &ServiceGroupConfig) -> ServiceProjection {
        let mut recent = HashSet::new();
        if let Some(last) = self.last_message() {
            for unit in last.units() {
                for (key, _) in unit.fields() {
                    recent.insert(key.to_owned());
                }
            }
        }
        self.project(group, Some(&recent))
    }

    fn project(
        &self,
        group: &ServiceGroupConfig,
        recent: Option<&HashSet<String>>,
    ) -> ServiceProjection {
        let mut services = Vec::new();
        for (status_register, entry) in &group.services {
            let value_register = match entry.value_register.as_deref() {
                Some(register) if !register.is_empty() => register,
                _ => status_register.as_str(),
            };
            let Some(FieldValue::Status(status)) =
                self.register(status_register).map(|r| &r.value)
            else {
                debug!(register = %status_register, "status value missing, skipping service");
                continue;
            };
            let Some(raw) = self.register(value_register).map(|r| &r.value) else {
                debug!(register = %value_register, "value missing, skipping service");
                continue;
            };
            if let Some(recent) = recent {
                if !recent.contains(status_register) && !recent.contains(value_register) {
                    continue;
                }
            }
            let Some(value) = display_value(raw, entry.scale) else {
                debug!(register = %value_register, "value not scalable, skipping service");
                continue;
            };
            services.push(ServiceReading {
                key: value_register.to_owned(),
                status: *status,
                value,
                name: entry.name.clone(),
                unit: entry.unit.clone(),
            });
        }
        ServiceProjection {
            controller: self.id().to_owned(),
            services,
            timestamp: self.last_message_at(),
        }
    }
}

/// Scale a raw register value for display, or stringify it when no
/// coefficient is configured.
fn display_value(raw: &FieldValue, scale: Option<f64>) -> Option<JsonValue> {
    match scale {
        None => Some(stringified(raw)),
        Some(coefficient) => scaled(raw, coefficient),
    }
}

fn stringified(raw: &FieldValue) -> JsonValue {
    match raw {
        FieldValue::ValueList(members) => {
            let rendered: Vec<String> = members
                .iter()
                .map(|m| match m {
                    Some(v) => v.to_string(),
                    None => "null".to_owned(),
                })
                .collect();
            json!(rendered)
        }
        other => json!(other.wire_value()),
    }
}

fn scaled(raw: &FieldValue, coefficient: f64) -> Option<JsonValue> {
    match raw {
        FieldValue::Status(v) => Some(json!(f64::from(*v) / coefficient)),
        FieldValue::Value(Scalar::Int(v)) => Some(json!(*v as f64 / coefficient)),
        FieldValue::Value(Scalar::Float(v)) => Some(json!(v / coefficient)),
        FieldValue::Value(Scalar::Text(v)) => v
            .parse::<f64>()
            .ok()
            .map(|parsed| json!(parsed / coefficient)),
        FieldValue::ValueList(members) => {
            let rendered: Vec<JsonValue> = members
                .iter()
                .map(|m| match m {
                    Some(v) => json!(*v as f64 / coefficient),
                    None => JsonValue::Null,
                })
                .collect();
            Some(json!(rendered))
        }
        FieldValue::FloatHex(_) | FieldValue::Data(_) | FieldValue::Query => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::TemporalPolicy;
    use sdc_common::config::ServiceEntryConfig;
    use sdc_proto::SdpMessage;

    fn group() -> ServiceGroupConfig {
        let mut group = ServiceGroupConfig::default();
        group.services.insert(
            "ABS".into(),
            ServiceEntryConfig {
                value_register: Some("ABW".into()),
                scale: Some(10.0),
                name: "flow".into(),
                unit: Some("l/min".into()),
            },
        );
        group.services.insert(
            "ACS".into(),
            ServiceEntryConfig {
                value_register: None,
                scale: None,
                name: "door".into(),
                unit: None,
            },
        );
        group
    }

    fn controller_with(wire: &str, received_at: f64) -> Controller {
        let mut controller = Controller::new("c1", 0.0);
        controller
            .apply_incoming(
                &SdpMessage::decode(wire).unwrap(),
                received_at,
                &TemporalPolicy::default(),
            )
            .unwrap();
        controller
    }

    #[test]
    fn projection_scales_and_stringifies() {
        let controller =
            controller_with("id:c1\nin:1,1000\nABS:2\nABW:150 null 30\nACS:1\n", 1000.0);
        let projection = controller.project_service(&group());
        assert_eq!(projection.controller, "c1");
        assert_eq!(projection.services.len(), 2);

        let flow = &projection.services[0];
        assert_eq!(flow.key, "ABW");
        assert_eq!(flow.status, 2);
        assert_eq!(flow.value, json!([15.0, null, 3.0]));
        assert_eq!(flow.unit.as_deref(), Some("l/min"));

        let door = &projection.services[1];
        assert_eq!(door.key, "ACS");
        assert_eq!(door.status, 1);
        assert_eq!(door.value, json!("1"));
    }

    #[test]
    fn incomplete_entries_are_silently_omitted() {
        // Status present but companion value register missing.
        let controller = controller_with("id:c1\nin:1,1000\nABS:2\n", 1000.0);
        let projection = controller.project_service(&group());
        assert!(projection.services.iter().all(|s| s.key != "ABW"));

        // Nothing at all projects to an empty list, not an error.
        let empty = Controller::new("c2", 0.0);
        assert!(empty.project_service(&group()).services.is_empty());
    }

    #[test]
    fn recent_projection_is_restricted_to_last_message() {
        let mut controller =
            controller_with("id:c1\nin:1,1000\nABS:2\nABW:150\nACS:1\n", 1000.0);
        controller
            .apply_incoming(
                &SdpMessage::decode("id:c1\nin:2,2000\nACS:3\n").unwrap(),
                2000.0,
                &TemporalPolicy::default(),
            )
            .unwrap();

        let recent = controller.project_service_recent(&group());
        assert_eq!(recent.services.len(), 1);
        assert_eq!(recent.services[0].key, "ACS");
        assert_eq!(recent.services[0].status, 3);

        let full = controller.project_service(&group());
        assert_eq!(full.services.len(), 2);
    }

    #[test]
    fn scaled_text_values_parse_or_skip() {
        let controller = controller_with("id:c1\nin:1,1000\nABS:2\nABW:40\n", 1000.0);
        let mut group = group();
        group.services.get_mut("ABS").unwrap().scale = Some(4.0);
        let projection = controller.project_service(&group);
        assert_eq!(projection.services[0].value, json!([10.0]));
    }
}
