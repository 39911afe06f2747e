//! ---
//! sdc_section: "00-meta"
//! sdc_subsection: "binary"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Binary entrypoint for the SDC collector daemon."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use sdc_bus::MessageBus;
use sdc_common::config::CollectorConfig;
use sdc_common::logging::init_tracing;
use sdc_metrics::{new_registry, spawn_http_server, ReceiverMetrics};
use sdc_net::UdpListener;
use sdc_receiver::{ReceiverConfig, SdpReceiver};
use sdc_state::ControllerRegistry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    version = concat!("SDC ", env!("CARGO_PKG_VERSION")),
    about = "SDC collector daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the collector")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("SDC {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/sdc.toml"));
    candidates.push(PathBuf::from("configs/sdc.dev.toml"));

    let loaded = CollectorConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("sdcd", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config).await
        }
        Commands::CheckConfig => {
            println!(
                "{}: ok ({} controllers, {} servicegroups)",
                loaded.source.display(),
                config.controllers.len(),
                config.servicegroups.len()
            );
            Ok(())
        }
    }
}

async fn run_daemon(config: CollectorConfig) -> Result<()> {
    let metrics_registry = new_registry();
    let receiver_metrics = ReceiverMetrics::new(metrics_registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let controllers = Arc::new(ControllerRegistry::from_setup(&config.controllers));
    receiver_metrics.set_controllers_known(controllers.len());
    let bus = Arc::new(MessageBus::new());

    let listener = UdpListener::bind(&config.udp).await?;
    let local_addr = listener.local_addr()?;
    let receiver = Arc::new(
        SdpReceiver::new(
            controllers,
            Arc::new(config.servicegroups.clone()),
            bus,
            listener.sink(),
            ReceiverConfig::from_config(&config),
        )
        .with_metrics(receiver_metrics),
    );

    let udp_task = tokio::spawn(listener.run(receiver));

    info!(udp = %local_addr, "collector running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    udp_task.abort();
    if let Err(err) = udp_task.await {
        if !err.is_cancelled() {
            warn!(error = %err, "udp listener task failed");
        }
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}
