//! ---
//! sdc_section: "05-receiver-pipeline"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Decode, authenticate and apply incoming SDP datagrams."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use sdc_bus::MessageBus;
use sdc_common::config::{CollectorConfig, ServiceGroupConfig};
use sdc_common::time::unix_now;
use sdc_metrics::ReceiverMetrics;
use sdc_proto::{DecodeError, EncodeError, FieldError, SdpMessage, SignedSdp, TimeBase};
use sdc_state::{Controller, ControllerRegistry, StateError, TemporalPolicy};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{DatagramSink, HostRef};

/// Per-datagram failure. All variants are local: the datagram is dropped,
/// subsequent datagrams keep flowing and no other controller is affected.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// Payload exceeds the configured ceiling; rejected before decode.
    #[error("datagram of {size} bytes exceeds the {limit} byte ceiling")]
    Oversized {
        /// Received payload size.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// Payload is not valid UTF-8.
    #[error("datagram is not valid UTF-8")]
    Encoding,
    /// Malformed datagram text.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Controller is unknown and auto-registration is disabled.
    #[error("unknown controller '{0}'")]
    UnknownController(String),
    /// A signed datagram arrived for a controller without a secret key.
    #[error("signed datagram from unsecured controller '{0}'")]
    UnexpectedSignature(String),
    /// A secured controller sent an unsigned datagram after the handshake.
    #[error("unsigned datagram from secured controller '{0}'")]
    MissingSignature(String),
    /// Signature verification failed; a fresh nonce was issued.
    #[error("signature verification failed for controller '{0}'")]
    BadSignature(String),
    /// Signed traffic must carry a sequence number.
    #[error("datagram from controller '{0}' carries no sequence number")]
    MissingSequence(String),
    /// Replay protection: the sequence did not advance.
    #[error("sequence {seq} does not exceed last accepted {last} for controller '{controller}'")]
    SequenceReplay {
        /// Addressed controller.
        controller: String,
        /// Received sequence number.
        seq: u64,
        /// Highest previously accepted sequence number.
        last: u64,
    },
    /// Temporal or ordering rejection during state application.
    #[error(transparent)]
    State(#[from] StateError),
    /// Building an outgoing packet failed.
    #[error(transparent)]
    Field(#[from] FieldError),
    /// Encoding an outgoing packet failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The transport rejected an outgoing packet.
    #[error("transport send failed: {0}")]
    Send(#[from] std::io::Error),
}

impl ReceiverError {
    /// Stable label for the drop-reason metric.
    pub fn reason(&self) -> &'static str {
        match self {
            ReceiverError::Oversized { .. } => "oversized",
            ReceiverError::Encoding => "encoding",
            ReceiverError::Decode(_) => "decode",
            ReceiverError::UnknownController(_) => "unknown_controller",
            ReceiverError::UnexpectedSignature(_) => "unexpected_signature",
            ReceiverError::MissingSignature(_) => "missing_signature",
            ReceiverError::BadSignature(_) => "bad_signature",
            ReceiverError::MissingSequence(_) => "missing_sequence",
            ReceiverError::SequenceReplay { .. } => "sequence_replay",
            ReceiverError::State(StateError::FutureTimestamp { .. }) => "future_timestamp",
            ReceiverError::State(StateError::StaleTimestamp { .. }) => "stale_timestamp",
            ReceiverError::State(StateError::OutOfOrder { .. }) => "out_of_order",
            ReceiverError::State(_) | ReceiverError::Field(_) | ReceiverError::Encode(_) => {
                "internal"
            }
            ReceiverError::Send(_) => "send",
        }
    }
}

/// What happened to one accepted datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum DatagramOutcome {
    /// The datagram was applied; an ACK went out and notifications were
    /// published.
    Applied {
        /// Addressed controller.
        controller: String,
        /// Registers updated.
        updated: usize,
        /// Query markers processed.
        queried: usize,
    },
    /// A nonce was issued (or re-issued) instead of applying the datagram.
    NonceIssued {
        /// Addressed controller.
        controller: String,
    },
}

/// Receiver policy knobs, derived from the collector configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    /// Datagrams above this size are rejected before decode.
    pub max_datagram: usize,
    /// Create controller records for previously unseen ids.
    pub auto_register: bool,
    /// Temporal acceptance policy handed to state application.
    pub temporal: TemporalPolicy,
}

impl ReceiverConfig {
    /// Derive the receiver policy from the loaded configuration.
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            max_datagram: config.udp.max_datagram,
            auto_register: config.protocol.auto_register,
            temporal: TemporalPolicy::from(&config.protocol),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self::from_config(&CollectorConfig::default())
    }
}

/// The datagram receiver: ties decoding, authentication, state application
/// and fan-out notification together.
pub struct SdpReceiver {
    controllers: Arc<ControllerRegistry>,
    servicegroups: Arc<IndexMap<String, ServiceGroupConfig>>,
    bus: Arc<MessageBus>,
    sink: Arc<dyn DatagramSink>,
    config: ReceiverConfig,
    metrics: Option<ReceiverMetrics>,
}

impl SdpReceiver {
    /// Compose a receiver from its collaborators.
    pub fn new(
        controllers: Arc<ControllerRegistry>,
        servicegroups: Arc<IndexMap<String, ServiceGroupConfig>>,
        bus: Arc<MessageBus>,
        sink: Arc<dyn DatagramSink>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            controllers,
            servicegroups,
            bus,
            sink,
            config,
            metrics: None,
        }
    }

    /// Attach prometheus metric families.
    pub fn with_metrics(mut self, metrics: ReceiverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Entry point for the transport layer: process one raw datagram.
    pub fn on_datagram(
        &self,
        sender: &HostRef,
        payload: &[u8],
    ) -> Result<DatagramOutcome, ReceiverError> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_datagram();
        }
        let result = self.process(sender, payload);
        match &result {
            Ok(outcome) => debug!(%sender, ?outcome, "datagram processed"),
            Err(error) => {
                warn!(%sender, error = %error, reason = error.reason(), "datagram dropped");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_dropped(error.reason());
                }
            }
        }
        result
    }

    fn process(
        &self,
        sender: &HostRef,
        payload: &[u8],
    ) -> Result<DatagramOutcome, ReceiverError> {
        if payload.len() > self.config.max_datagram {
            return Err(ReceiverError::Oversized {
                size: payload.len(),
                limit: self.config.max_datagram,
            });
        }
        let text = std::str::from_utf8(payload).map_err(|_| ReceiverError::Encoding)?;
        let signed = SignedSdp::decode(text)?;
        let controller_id = signed
            .message()
            .id()
            .ok_or(ReceiverError::Decode(DecodeError::MissingId))?
            .to_owned();

        let handle = if self.config.auto_register {
            let handle = self.controllers.find_or_create(&controller_id);
            if let Some(metrics) = &self.metrics {
                metrics.set_controllers_known(self.controllers.len());
            }
            handle
        } else {
            self.controllers
                .lookup(&controller_id)
                .ok_or_else(|| ReceiverError::UnknownController(controller_id.clone()))?
        };

        let mut controller = handle.lock();
        let secret_key = controller.secret_key().map(str::to_owned);

        match &secret_key {
            None => {
                if signed.is_signed() {
                    return Err(ReceiverError::UnexpectedSignature(controller_id));
                }
            }
            Some(key) => {
                let Some(nonce) = controller.nonce().map(str::to_owned) else {
                    // First contact with a secured device: hand out a nonce
                    // and wait for a signed reply before accepting anything.
                    self.issue_nonce(&mut controller, sender)?;
                    return Ok(DatagramOutcome::NonceIssued {
                        controller: controller_id,
                    });
                };
                if !signed.is_signed() {
                    self.issue_nonce(&mut controller, sender)?;
                    return Err(ReceiverError::MissingSignature(controller_id));
                }
                if !signed.verify(key, &nonce) {
                    self.issue_nonce(&mut controller, sender)?;
                    return Err(ReceiverError::BadSignature(controller_id));
                }
            }
        }

        let highest_seq =
            match self.check_sequence(&mut controller, signed.message(), secret_key.is_some()) {
                Ok(seq) => seq,
                Err(error) => {
                    if secret_key.is_some() {
                        self.issue_nonce(&mut controller, sender)?;
                    }
                    return Err(error);
                }
            };
        if let Some(seq) = highest_seq {
            controller.set_last_seq(seq);
        }

        let applied =
            controller.apply_incoming(signed.message(), unix_now(), &self.config.temporal)?;

        let ack = controller.build_ack()?;
        let ack_nonce = controller.nonce().map(str::to_owned);
        let ack_wire = SignedSdp::with_credentials(ack, secret_key, ack_nonce).encode()?;
        self.sink.send(sender, ack_wire.as_bytes())?;
        if let Some(metrics) = &self.metrics {
            metrics.inc_ack();
            metrics.add_registers_updated(applied.updated as u64);
        }

        self.publish(&controller);
        info!(
            controller = %controller_id,
            updated = applied.updated,
            queried = applied.queried,
            "datagram applied"
        );
        Ok(DatagramOutcome::Applied {
            controller: controller_id,
            updated: applied.updated,
            queried: applied.queried,
        })
    }

    /// Replay-protection gate. Signed traffic must carry a sequence in every
    /// unit; unsigned traffic is gated only when a sequence is present.
    fn check_sequence(
        &self,
        controller: &mut Controller,
        message: &SdpMessage,
        signed_required: bool,
    ) -> Result<Option<u64>, ReceiverError> {
        let mut highest: Option<u64> = None;
        for unit in message.units() {
            match unit.time_base() {
                Some(TimeBase { seq, .. }) => {
                    let floor = highest.or(controller.last_seq());
                    if let Some(floor) = floor {
                        if seq <= floor {
                            return Err(ReceiverError::SequenceReplay {
                                controller: controller.id().to_owned(),
                                seq,
                                last: floor,
                            });
                        }
                    }
                    highest = Some(seq);
                }
                None if signed_required => {
                    return Err(ReceiverError::MissingSequence(
                        controller.id().to_owned(),
                    ));
                }
                None => {}
            }
        }
        Ok(highest)
    }

    fn issue_nonce(
        &self,
        controller: &mut Controller,
        sender: &HostRef,
    ) -> Result<(), ReceiverError> {
        let nonce = generate_nonce();
        controller.set_nonce(nonce.clone());
        let mut packet = SdpMessage::with_id(controller.id());
        packet.add("nonce", nonce.as_str())?;
        let wire = packet.encode()?;
        self.sink.send(sender, wire.as_bytes())?;
        controller.record_nonce_sent();
        if let Some(metrics) = &self.metrics {
            metrics.inc_nonce();
        }
        info!(controller = %controller.id(), "nonce issued");
        Ok(())
    }

    fn publish(&self, controller: &Controller) {
        let controller_id = controller.id();
        self.bus.publish(
            &format!("controllers/{controller_id}"),
            controller.controller_data(),
        );
        self.bus
            .publish(&format!("hosts/{controller_id}"), controller.host_data());

        let group = controller
            .setup()
            .servicegroup
            .as_deref()
            .and_then(|name| self.servicegroups.get(name));
        if let Some(group) = group {
            let projection = controller.project_service_recent(group);
            if !projection.services.is_empty() {
                self.bus
                    .publish(&format!("services/{controller_id}"), projection.to_json());
            }
        }
    }
}

/// Nonce derived from the current time plus random bits; opaque to devices.
fn generate_nonce() -> String {
    let micros = (unix_now() * 1_000_000.0) as u64;
    format!("{micros:x}{:04x}", rand::random::<u16>())
}
