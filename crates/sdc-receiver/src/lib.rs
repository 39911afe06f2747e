//! ---
//! sdc_section: "05-receiver-pipeline"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Decode, authenticate and apply incoming SDP datagrams."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! Receiver pipeline.
//!
//! [`SdpReceiver::on_datagram`] is the transport entry point: it decodes the
//! raw payload, authenticates it against the addressed controller's secret
//! key, nonce and sequence number, applies accepted updates to the
//! controller state, answers with an ACK and publishes change notifications
//! on the message bus. Every per-datagram failure is a typed, local outcome;
//! one bad datagram never stops the pipeline.

pub mod receiver;
pub mod transport;

pub use receiver::{DatagramOutcome, ReceiverConfig, ReceiverError, SdpReceiver};
pub use transport::{DatagramSink, HostRef, MemorySink};
