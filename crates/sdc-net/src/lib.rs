//! ---
//! sdc_section: "06-transport"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "UDP datagram transport for the receiver pipeline."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! UDP transport.
//!
//! One socket serves both directions: the listener loop feeds incoming
//! datagrams to the receiver, and [`UdpSink`] sends ACK and nonce packets
//! back out. The read loop is a single task, which trivially serialises
//! processing per controller.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sdc_common::config::UdpConfig;
use sdc_receiver::{DatagramSink, HostRef, SdpReceiver};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Bound UDP endpoint of the collector.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    recv_buffer: usize,
}

impl UdpListener {
    /// Bind the configured listen address.
    pub async fn bind(config: &UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind udp listener {}", config.listen))?;
        info!(address = %config.listen, "udp listener bound");
        Ok(Self {
            socket: Arc::new(socket),
            recv_buffer: config.recv_buffer,
        })
    }

    /// The effective local address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("udp listener has no local address")
    }

    /// Outbound sink sharing this listener's socket.
    pub fn sink(&self) -> Arc<dyn DatagramSink> {
        Arc::new(UdpSink {
            socket: self.socket.clone(),
        })
    }

    /// Run the receive loop forever, handing every datagram to the receiver.
    /// Per-datagram failures are handled (logged and counted) inside the
    /// receiver; only socket failures abort the loop.
    pub async fn run(self, receiver: Arc<SdpReceiver>) -> Result<()> {
        let mut buffer = vec![0u8; self.recv_buffer];
        loop {
            let (len, addr) = self
                .socket
                .recv_from(&mut buffer)
                .await
                .context("udp receive failed")?;
            let host = HostRef::new(addr);
            debug!(%host, bytes = len, "datagram received");
            let _ = receiver.on_datagram(&host, &buffer[..len]);
        }
    }
}

/// Sending half over the shared socket. Uses the non-blocking send path; a
/// datagram that cannot be queued is dropped like any other lost UDP packet.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl DatagramSink for UdpSink {
    fn send(&self, target: &HostRef, payload: &[u8]) -> std::io::Result<()> {
        self.socket.try_send_to(payload, target.addr()).map(|_| ())
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}
