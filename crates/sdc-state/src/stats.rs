//! ---
//! sdc_section: "03-controller-state"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Controller state, send queue and service projection."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use serde::Serialize;

/// Accumulating per-controller counters.
///
/// A fixed struct: the set of counters is part of the interface, and a leaf
/// can never be redefined as a branch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    /// Unix time the controller record was created.
    pub created_at: f64,
    /// Datagrams accepted and applied.
    pub rx_ok: u64,
    /// Datagrams rejected during state application.
    pub rx_errors: u64,
    /// Rejections due to a timestamp ahead of the wall clock.
    pub rx_error_future: u64,
    /// Rejections due to a timestamp outside the retention window.
    pub rx_error_stale: u64,
    /// Rejections due to a timestamp older than the accepted state.
    pub rx_error_out_of_order: u64,
    /// Query markers received.
    pub rx_queries: u64,
    /// Send-queue entries confirmed by a matching device report.
    pub updates_accepted: u64,
    /// Device reports that did not match the pending value.
    pub updates_mismatched: u64,
    /// Send-queue entries dropped after exhausting their retries.
    pub updates_expired: u64,
    /// Nonce packets transmitted.
    pub tx_nonce: u64,
    /// ACK packets transmitted.
    pub tx_ack_packets: u64,
    /// Send-queue fields carried in transmitted ACKs.
    pub tx_ack_fields: u64,
    /// Proactive settings packets transmitted.
    pub tx_settings_packets: u64,
    /// Human-readable reason of the last rejection.
    pub last_error: Option<String>,
    /// Unix time of the last accepted datagram.
    pub last_rx_at: Option<f64>,
}
