//! ---
//! sdc_section: "05-receiver-pipeline"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Decode, authenticate and apply incoming SDP datagrams."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Opaque reference to a device endpoint. The address is transport detail;
/// the SDP grammar itself never sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRef {
    addr: SocketAddr,
}

impl HostRef {
    /// Wrap a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The wrapped socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp://{}", self.addr)
    }
}

impl From<SocketAddr> for HostRef {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Outbound transport used for ACK and nonce packets.
pub trait DatagramSink: Send + Sync {
    /// Send a payload to the device endpoint.
    fn send(&self, target: &HostRef, payload: &[u8]) -> std::io::Result<()>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// In-memory sink backed by a mutex protected queue, primarily for tests and
/// single-process integration.
#[derive(Clone, Default)]
pub struct MemorySink {
    sent: Arc<Mutex<Vec<(HostRef, Vec<u8>)>>>,
}

impl MemorySink {
    /// Create a new in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<(HostRef, Vec<u8>)> {
        let mut guard = self.sent.lock().expect("sink poisoned");
        std::mem::take(&mut *guard)
    }

    /// Number of queued payloads.
    pub fn len(&self) -> usize {
        self.sent.lock().expect("sink poisoned").len()
    }

    /// Whether nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DatagramSink for MemorySink {
    fn send(&self, target: &HostRef, payload: &[u8]) -> std::io::Result<()> {
        let mut guard = self.sent.lock().expect("sink poisoned");
        guard.push((*target, payload.to_vec()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
