//! ---
//! sdc_section: "07-metrics"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Metrics collection and export utilities."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type())
                    .unwrap_or_else(|_| HeaderValue::from_static("text/plain")),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the datagram receiver pipeline.
#[derive(Clone)]
pub struct ReceiverMetrics {
    registry: SharedRegistry,
    datagrams_total: IntCounter,
    datagrams_dropped: IntCounterVec,
    registers_updated: IntCounter,
    nonces_issued: IntCounter,
    acks_sent: IntCounter,
    controllers_known: IntGauge,
}

impl ReceiverMetrics {
    /// Register the receiver metric families on the shared registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let datagrams_total = IntCounter::with_opts(Opts::new(
            "sdc_datagrams_total",
            "Total number of datagrams handed to the receiver",
        ))?;
        registry.register(Box::new(datagrams_total.clone()))?;

        let datagrams_dropped = IntCounterVec::new(
            Opts::new(
                "sdc_datagrams_dropped_total",
                "Datagrams dropped before state application, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(datagrams_dropped.clone()))?;

        let registers_updated = IntCounter::with_opts(Opts::new(
            "sdc_registers_updated_total",
            "Register values accepted into controller state",
        ))?;
        registry.register(Box::new(registers_updated.clone()))?;

        let nonces_issued = IntCounter::with_opts(Opts::new(
            "sdc_nonces_issued_total",
            "Authentication nonces issued to controllers",
        ))?;
        registry.register(Box::new(nonces_issued.clone()))?;

        let acks_sent = IntCounter::with_opts(Opts::new(
            "sdc_acks_sent_total",
            "Acknowledgement packets sent back to controllers",
        ))?;
        registry.register(Box::new(acks_sent.clone()))?;

        let controllers_known = IntGauge::with_opts(Opts::new(
            "sdc_controllers_known",
            "Number of controllers in the registry",
        ))?;
        registry.register(Box::new(controllers_known.clone()))?;

        Ok(Self {
            registry,
            datagrams_total,
            datagrams_dropped,
            registers_updated,
            nonces_issued,
            acks_sent,
            controllers_known,
        })
    }

    /// The registry the families are registered on.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one received datagram.
    pub fn inc_datagram(&self) {
        self.datagrams_total.inc();
    }

    /// Count one dropped datagram with its reason label.
    pub fn inc_dropped(&self, reason: &str) {
        self.datagrams_dropped.with_label_values(&[reason]).inc();
    }

    /// Count accepted register updates.
    pub fn add_registers_updated(&self, count: u64) {
        self.registers_updated.inc_by(count);
    }

    /// Count one issued nonce.
    pub fn inc_nonce(&self) {
        self.nonces_issued.inc();
    }

    /// Count one transmitted ACK.
    pub fn inc_ack(&self) {
        self.acks_sent.inc();
    }

    /// Track the registry population.
    pub fn set_controllers_known(&self, count: usize) {
        self.controllers_known.set(count as i64);
    }
}
