//! ---
//! sdc_section: "01-shared-runtime"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Shared primitives and utilities for the collector runtime."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::logging::LogFormat;

fn default_udp_listen() -> SocketAddr {
    "0.0.0.0:44444".parse().expect("valid default udp address")
}

fn default_max_datagram() -> usize {
    5_000
}

fn default_recv_buffer() -> usize {
    100_000
}

fn default_future_tolerance() -> Duration {
    Duration::from_secs(60)
}

fn default_retention_window() -> Duration {
    Duration::from_secs(60 * 60 * 24 * 7)
}

fn default_retry_limit() -> u32 {
    10
}

fn default_auto_register() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the collector runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Static controller setup keyed by controller id. Controllers missing
    /// here are still accepted when `protocol.auto_register` is on.
    #[serde(default)]
    pub controllers: IndexMap<String, ControllerSetupConfig>,
    /// Service projection tables keyed by servicegroup name.
    #[serde(default)]
    pub servicegroups: IndexMap<String, ServiceGroupConfig>,
}

/// Metadata describing where a [`CollectorConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedCollectorConfig {
    pub config: CollectorConfig,
    pub source: PathBuf,
}

impl CollectorConfig {
    pub const ENV_CONFIG_PATH: &str = "SDC_CONFIG";

    /// Load configuration from disk, respecting the `SDC_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedCollectorConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedCollectorConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedCollectorConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<CollectorConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a controller setup by identifier.
    pub fn controller(&self, controller_id: &str) -> Option<&ControllerSetupConfig> {
        self.controllers.get(controller_id)
    }

    /// Retrieve a servicegroup table by name.
    pub fn servicegroup(&self, name: &str) -> Option<&ServiceGroupConfig> {
        self.servicegroups.get(name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.udp.max_datagram == 0 {
            return Err(anyhow!("udp.max_datagram must be greater than zero"));
        }
        if self.udp.recv_buffer < self.udp.max_datagram {
            return Err(anyhow!(
                "udp.recv_buffer ({}) must not be smaller than udp.max_datagram ({})",
                self.udp.recv_buffer,
                self.udp.max_datagram
            ));
        }
        if self.protocol.retry_limit == 0 {
            return Err(anyhow!("protocol.retry_limit must be at least 1"));
        }
        for (controller_id, setup) in &self.controllers {
            if let Some(key) = &setup.secret_key {
                if key.is_empty() {
                    return Err(anyhow!(
                        "controller '{}' declares an empty secret_key",
                        controller_id
                    ));
                }
            }
            if let Some(group) = &setup.servicegroup {
                if !self.servicegroups.contains_key(group) {
                    return Err(anyhow!(
                        "controller '{}' references unknown servicegroup '{}'",
                        controller_id,
                        group
                    ));
                }
            }
        }
        for (name, group) in &self.servicegroups {
            group.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for CollectorConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: CollectorConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// UDP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_udp_listen")]
    pub listen: SocketAddr,
    /// Datagrams above this size are rejected before decode.
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,
    /// Size of the receive buffer handed to the socket.
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            listen: default_udp_listen(),
            max_datagram: default_max_datagram(),
            recv_buffer: default_recv_buffer(),
        }
    }
}

/// Protocol policy knobs. The temporal bounds are deployment policy, not
/// wire-format constants.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum amount a datagram timestamp may run ahead of the wall clock.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_future_tolerance", rename = "future_tolerance_secs")]
    pub future_tolerance: Duration,
    /// Datagrams timestamped further back than this are discarded.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_retention_window", rename = "retention_window_secs")]
    pub retention_window: Duration,
    /// Unconfirmed send-queue entries are dropped after this many mismatches.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Create controller records for previously unseen ids.
    #[serde(default = "default_auto_register")]
    pub auto_register: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            future_tolerance: default_future_tolerance(),
            retention_window: default_retention_window(),
            retry_limit: default_retry_limit(),
            auto_register: default_auto_register(),
        }
    }
}

/// Logging sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            file_prefix: None,
            format: default_log_format(),
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Static per-controller setup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerSetupConfig {
    /// HMAC secret. Absence permits unsigned operation for the device.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Servicegroup used for the external projection of this controller.
    #[serde(default)]
    pub servicegroup: Option<String>,
}

impl ControllerSetupConfig {
    /// SHA-256 fingerprint of the secret key for audit logging. The key
    /// itself never reaches the logs.
    pub fn key_fingerprint(&self) -> Option<String> {
        self.secret_key.as_ref().map(|key| {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            hex::encode(hasher.finalize())
        })
    }
}

/// Projection table for one servicegroup, keyed by status register name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceGroupConfig {
    #[serde(default)]
    pub services: IndexMap<String, ServiceEntryConfig>,
}

impl ServiceGroupConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        for (status_register, entry) in &self.services {
            if status_register.is_empty() {
                return Err(anyhow!(
                    "servicegroup '{}' contains an empty status register name",
                    name
                ));
            }
            if let Some(scale) = entry.scale {
                if scale == 0.0 {
                    return Err(anyhow!(
                        "servicegroup '{}' service '{}' declares a zero scale coefficient",
                        name,
                        status_register
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One service row: status register plus optional companion value register.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceEntryConfig {
    /// Companion register carrying the measurement; defaults to the status
    /// register itself when empty.
    #[serde(default)]
    pub value_register: Option<String>,
    /// Raw values are divided by this coefficient for display.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Human-readable service name.
    #[serde(default)]
    pub name: String,
    /// Display unit.
    #[serde(default)]
    pub unit: Option<String>,
}
