//! ---
//! sdc_section: "03-controller-state"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Controller state, send queue and service projection."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::time::Duration;

use indexmap::IndexMap;
use sdc_common::config::{ControllerSetupConfig, ProtocolConfig};
use sdc_proto::{
    field::{ID_FIELD, TIMEBASE_FIELD},
    FieldError, FieldInput, FieldValue, MultipartError, Scalar, SdpMessage,
};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::stats::ControllerStats;

/// Temporal acceptance policy applied to incoming datagrams. Both bounds are
/// deployment configuration, not protocol constants.
#[derive(Debug, Clone, Copy)]
pub struct TemporalPolicy {
    /// Seconds a device timestamp may run ahead of the receive clock.
    pub future_tolerance: f64,
    /// Seconds back in time before a device timestamp is discarded.
    pub retention_window: f64,
    /// Mismatch count after which a pending write is dropped.
    pub retry_limit: u32,
}

impl Default for TemporalPolicy {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for TemporalPolicy {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            future_tolerance: config.future_tolerance.as_secs_f64(),
            retention_window: config.retention_window.as_secs_f64(),
            retry_limit: config.retry_limit,
        }
    }
}

impl TemporalPolicy {
    /// Policy with explicit bounds, mainly for tests.
    pub fn new(future_tolerance: Duration, retention_window: Duration, retry_limit: u32) -> Self {
        Self {
            future_tolerance: future_tolerance.as_secs_f64(),
            retention_window: retention_window.as_secs_f64(),
            retry_limit,
        }
    }
}

/// Rejections and contract failures raised by state application.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    /// Device timestamp runs ahead of the wall clock beyond tolerance.
    #[error("packet has future timestamp ({ahead:.1}s ahead)")]
    FutureTimestamp {
        /// Seconds the timestamp runs ahead of the receive clock.
        ahead: f64,
    },
    /// Device timestamp is outside the retention window.
    #[error("packet timestamp is too old ({age:.1}s)")]
    StaleTimestamp {
        /// Age of the timestamp in seconds at receive time.
        age: f64,
    },
    /// Effective timestamp precedes the already accepted state.
    #[error("packet is older than accepted state (state {state}, packet {packet})")]
    OutOfOrder {
        /// Timestamp of the accepted state.
        state: f64,
        /// Effective timestamp of the rejected packet.
        packet: f64,
    },
    /// ACK construction without a previously accepted message.
    #[error("no accepted message to acknowledge")]
    NoAcceptedMessage,
    /// Field manipulation failed while building an outgoing packet.
    #[error(transparent)]
    Field(#[from] FieldError),
    /// Multipart assembly failed while building an outgoing packet.
    #[error(transparent)]
    Multipart(#[from] MultipartError),
}

/// One register: last reported value and the timestamp it was reported for.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntry {
    /// Last accepted value.
    pub value: FieldValue,
    /// Effective timestamp of that value.
    pub timestamp: f64,
}

/// Point-in-time copy of one register row.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterReading {
    /// Register name (with type suffix).
    pub register: String,
    /// Value at snapshot time.
    pub value: FieldValue,
    /// Effective timestamp of the value.
    pub timestamp: f64,
}

/// A register write awaiting confirmation by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// Value the device should adopt.
    pub value: FieldValue,
    /// Mismatched confirmations seen so far.
    pub tries: u32,
}

/// Summary of one successful state application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedUpdate {
    /// Registers updated.
    pub updated: usize,
    /// Query markers processed.
    pub queried: usize,
    /// Effective timestamp the state advanced to.
    pub effective_timestamp: f64,
}

/// Protocol state of one field device.
#[derive(Debug, Clone)]
pub struct Controller {
    id: String,
    setup: ControllerSetupConfig,
    nonce: Option<String>,
    last_seq: Option<u64>,
    registers: IndexMap<String, RegisterEntry>,
    send_queue: IndexMap<String, PendingWrite>,
    last_message: Option<SdpMessage>,
    last_message_at: Option<f64>,
    state_at: Option<f64>,
    stats: ControllerStats,
}

impl Controller {
    /// Create a controller record.
    pub fn new(id: impl Into<String>, created_at: f64) -> Self {
        let id = id.into();
        info!(controller = %id, "create a new controller");
        let stats = ControllerStats {
            created_at,
            ..ControllerStats::default()
        };
        Self {
            id,
            setup: ControllerSetupConfig::default(),
            nonce: None,
            last_seq: None,
            registers: IndexMap::new(),
            send_queue: IndexMap::new(),
            last_message: None,
            last_message_at: None,
            state_at: None,
            stats,
        }
    }

    /// Stable device id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Static setup for this controller.
    pub fn setup(&self) -> &ControllerSetupConfig {
        &self.setup
    }

    /// Replace the static setup.
    pub fn set_setup(&mut self, setup: ControllerSetupConfig) {
        self.setup = setup;
    }

    /// HMAC secret, when the device is secured.
    pub fn secret_key(&self) -> Option<&str> {
        self.setup.secret_key.as_deref()
    }

    /// Currently issued nonce.
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Issue a nonce and restart sequence tracking under it.
    pub fn set_nonce(&mut self, nonce: impl Into<String>) {
        self.nonce = Some(nonce.into());
        self.last_seq = None;
    }

    /// Count a transmitted nonce packet.
    pub fn record_nonce_sent(&mut self) {
        self.stats.tx_nonce += 1;
    }

    /// Last accepted sequence number.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Record an accepted sequence number.
    pub fn set_last_seq(&mut self, seq: u64) {
        self.last_seq = Some(seq);
    }

    /// Timestamp of the accepted state, if any state was accepted.
    pub fn state_timestamp(&self) -> Option<f64> {
        self.state_at
    }

    /// The last accepted message.
    pub fn last_message(&self) -> Option<&SdpMessage> {
        self.last_message.as_ref()
    }

    /// Receive time of the last accepted message.
    pub fn last_message_at(&self) -> Option<f64> {
        self.last_message_at
    }

    /// Statistics counters.
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Value and timestamp of a register.
    pub fn register(&self, name: &str) -> Option<&RegisterEntry> {
        self.registers.get(name)
    }

    /// Point-in-time copy of all registers; safe to iterate repeatedly while
    /// the controller keeps changing.
    pub fn register_snapshot(&self) -> Vec<RegisterReading> {
        self.registers
            .iter()
            .map(|(register, entry)| RegisterReading {
                register: register.clone(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
            })
            .collect()
    }

    /// Pending writes in queue order.
    pub fn send_queue(&self) -> impl Iterator<Item = (&str, &PendingWrite)> {
        self.send_queue.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of pending writes.
    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Enqueue a register write for the device to adopt.
    pub fn queue_write(
        &mut self,
        register: &str,
        value: impl Into<FieldInput>,
    ) -> Result<(), FieldError> {
        let value = FieldValue::for_name(register, value.into())?;
        debug!(controller = %self.id, register, value = %value.wire_value(), "queue write");
        self.send_queue
            .insert(register.to_owned(), PendingWrite { value, tries: 0 });
        Ok(())
    }

    /// Drop all pending writes.
    pub fn queue_reset(&mut self) {
        debug!(controller = %self.id, "send queue reset");
        self.send_queue.clear();
    }

    /// Apply an accepted (decoded and authenticated) message to the register
    /// state and reconcile the send queue.
    ///
    /// Validation happens before any mutation: a rejected datagram leaves
    /// registers and the send queue untouched.
    pub fn apply_incoming(
        &mut self,
        message: &SdpMessage,
        received_at: f64,
        policy: &TemporalPolicy,
    ) -> Result<AppliedUpdate, StateError> {
        let mut effective = Vec::new();
        for unit in message.units() {
            let ts = match unit.time_base().and_then(|tb| tb.timestamp) {
                Some(device_ts) => {
                    if device_ts > received_at + policy.future_tolerance {
                        return Err(self.reject(StateError::FutureTimestamp {
                            ahead: device_ts - received_at,
                        }));
                    }
                    if received_at - device_ts > policy.retention_window {
                        return Err(self.reject(StateError::StaleTimestamp {
                            age: received_at - device_ts,
                        }));
                    }
                    device_ts
                }
                None => received_at,
            };
            if let Some(state_at) = self.state_at {
                if ts < state_at {
                    return Err(self.reject(StateError::OutOfOrder {
                        state: state_at,
                        packet: ts,
                    }));
                }
            }
            effective.push(ts);
        }

        let mut updated = 0;
        let mut queried = 0;
        let mut last_effective = received_at;
        for (unit, ts) in message.units().zip(effective) {
            for (register, value) in unit.fields() {
                if register == ID_FIELD || register == TIMEBASE_FIELD {
                    continue;
                }
                if value.is_query() {
                    self.enqueue_current(register);
                    self.stats.rx_queries += 1;
                    queried += 1;
                } else {
                    self.registers.insert(
                        register.to_owned(),
                        RegisterEntry {
                            value: value.clone(),
                            timestamp: ts,
                        },
                    );
                    self.reconcile_queue(register, value, policy.retry_limit);
                    updated += 1;
                }
            }
            last_effective = ts;
        }

        self.state_at = Some(last_effective);
        self.last_message = Some(message.clone());
        self.last_message_at = Some(received_at);
        self.stats.rx_ok += 1;
        self.stats.last_rx_at = Some(received_at);
        Ok(AppliedUpdate {
            updated,
            queried,
            effective_timestamp: last_effective,
        })
    }

    fn reject(&mut self, error: StateError) -> StateError {
        warn!(controller = %self.id, error = %error, "datagram rejected");
        self.stats.rx_errors += 1;
        self.stats.last_error = Some(error.to_string());
        match &error {
            StateError::FutureTimestamp { .. } => self.stats.rx_error_future += 1,
            StateError::StaleTimestamp { .. } => self.stats.rx_error_stale += 1,
            StateError::OutOfOrder { .. } => self.stats.rx_error_out_of_order += 1,
            _ => {}
        }
        error
    }

    /// A query re-sends the last known value, when one exists.
    fn enqueue_current(&mut self, register: &str) {
        if let Some(entry) = self.registers.get(register) {
            self.send_queue.insert(
                register.to_owned(),
                PendingWrite {
                    value: entry.value.clone(),
                    tries: 0,
                },
            );
        }
    }

    fn reconcile_queue(&mut self, register: &str, reported: &FieldValue, retry_limit: u32) {
        let Some(pending) = self.send_queue.get_mut(register) else {
            return;
        };
        if pending.value.wire_value() == reported.wire_value() {
            self.send_queue.shift_remove(register);
            self.stats.updates_accepted += 1;
            return;
        }
        pending.tries += 1;
        self.stats.updates_mismatched += 1;
        warn!(
            controller = %self.id,
            register,
            reported = %reported.wire_value(),
            pending = %pending.value.wire_value(),
            tries = pending.tries,
            "device reported a different value than pending"
        );
        if pending.tries > retry_limit {
            self.send_queue.shift_remove(register);
            self.stats.updates_expired += 1;
            warn!(controller = %self.id, register, "pending write expired");
        }
    }

    /// Build the ACK for the last accepted message: `id`, the `in` echo per
    /// unit, and every remaining send-queue entry.
    pub fn build_ack(&mut self) -> Result<SdpMessage, StateError> {
        let last = self
            .last_message
            .as_ref()
            .ok_or(StateError::NoAcceptedMessage)?;
        let mut ack = SdpMessage::with_id(self.id.clone());
        if last.is_multipart() {
            let mut echoes = Vec::new();
            for piece in last.pieces() {
                let mut echo = SdpMessage::new();
                if let Some(FieldValue::Data(time_base)) = piece.get(TIMEBASE_FIELD) {
                    echo.add(TIMEBASE_FIELD, time_base.as_str())?;
                }
                echoes.push(echo);
            }
            if let Some(tail) = echoes.last_mut() {
                Self::add_queue_fields(&self.send_queue, tail)?;
            }
            for echo in echoes {
                ack.push_piece(echo)?;
            }
        } else {
            if let Some(FieldValue::Data(time_base)) = last.get(TIMEBASE_FIELD) {
                ack.add(TIMEBASE_FIELD, time_base.as_str())?;
            }
            Self::add_queue_fields(&self.send_queue, &mut ack)?;
        }
        self.stats.tx_ack_packets += 1;
        self.stats.tx_ack_fields += self.send_queue.len() as u64;
        Ok(ack)
    }

    /// Build a proactive settings packet carrying the send queue.
    pub fn build_settings(&mut self) -> Result<SdpMessage, StateError> {
        let mut packet = SdpMessage::with_id(self.id.clone());
        Self::add_queue_fields(&self.send_queue, &mut packet)?;
        self.stats.tx_settings_packets += 1;
        Ok(packet)
    }

    fn add_queue_fields(
        queue: &IndexMap<String, PendingWrite>,
        target: &mut SdpMessage,
    ) -> Result<(), FieldError> {
        for (register, pending) in queue {
            target.add(register, FieldInput::from(&pending.value))?;
        }
        Ok(())
    }

    /// Registers rendered as an API payload.
    pub fn controller_data(&self) -> JsonValue {
        let registers: Vec<JsonValue> = self
            .register_snapshot()
            .into_iter()
            .map(|reading| {
                json!({
                    "register": reading.register,
                    "value": field_json(&reading.value),
                    "timestamp": reading.timestamp,
                })
            })
            .collect();
        json!({ "controller": self.id, "registers": registers })
    }

    /// Raw view of the last accepted message plus statistics.
    pub fn host_data(&self) -> JsonValue {
        let mut registers = Vec::new();
        if let Some(last) = &self.last_message {
            for unit in last.units() {
                for (key, value) in unit.fields() {
                    registers.push(json!({ "key": key, "value": field_json(value) }));
                }
            }
        }
        let mut body = json!({
            "controller": self.id,
            "registers": registers,
            "stats": serde_json::to_value(&self.stats).unwrap_or(JsonValue::Null),
        });
        if let Some(at) = self.last_message_at {
            body["timestamp"] = json!(at);
        }
        body
    }
}

/// JSON rendering of a field value for API payloads.
pub fn field_json(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Status(v) => json!(v),
        FieldValue::Value(Scalar::Int(v)) => json!(v),
        FieldValue::Value(Scalar::Float(v)) => json!(v),
        FieldValue::Value(Scalar::Text(v)) => json!(v),
        FieldValue::ValueList(members) => json!(members),
        FieldValue::FloatHex(v) | FieldValue::Data(v) => json!(v),
        FieldValue::Query => json!("?"),
    }
}
