//! Configuration management for legion-link.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::transport::ProtocolHint;
use crate::trigger::{MAX_LEAD_MS, MIN_LEAD_MS};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Directory under the platform config dir.
const CONFIG_DIR_NAME: &str = "legion-link";

/// Prefix for environment overrides, e.g. `LEGIONLINK_SYNC__LEAD_MS=600`.
const ENV_PREFIX: &str = "LEGIONLINK_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `LEGIONLINK_`, sections split by `__`)
/// 2. TOML config file at `<config dir>/legion-link/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How this node presents itself.
    pub node: NodeConfig,
    /// Sockets and link limits.
    pub network: NetworkConfig,
    /// Heartbeat, liveness and trigger timing.
    pub sync: SyncConfig,
}

/// Identity shown to the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name in the commander's device list.
    /// Defaults to `node-<first 8 chars of the node id>`.
    pub display_name: Option<String>,
    /// Lens label reported in heartbeats.
    pub lens_label: String,
}

/// Network-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the commander binds.
    pub bind_address: IpAddr,
    /// Port for the `fast` protocol hint.
    pub fast_port: u16,
    /// Port for the `alternate` protocol hint.
    pub alternate_port: u16,
    /// Connect timeout in milliseconds. Unset means wait for the OS.
    pub connect_timeout_ms: Option<u64>,
    /// Longest a single write may stall before the link is dropped.
    pub write_timeout_ms: u64,
    /// Messages queued per link before it is considered dead.
    pub outbound_buffer: usize,
    /// Largest accepted inbound record. Preview frames travel inline.
    pub max_frame_bytes: usize,
}

/// Timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the heartbeat/sync timer.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the commander forgets a field node.
    pub liveness_timeout_ms: u64,
    /// Lead between a global start being issued and recording beginning.
    pub lead_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            lens_label: "1x".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            fast_port: 8080,
            alternate_port: 8081,
            connect_timeout_ms: None,
            write_timeout_ms: 2_000,
            outbound_buffer: 64,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            liveness_timeout_ms: 15_000,
            lead_ms: 750,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        let config: Config = Self::figment(&config_file).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(config_file: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let network = &self.network;
        if network.fast_port == 0 || network.alternate_port == 0 {
            return Err(invalid("fast_port and alternate_port must be non-zero"));
        }
        if network.fast_port == network.alternate_port {
            return Err(invalid(format!(
                "fast_port and alternate_port must differ (both {})",
                network.fast_port
            )));
        }
        if network.write_timeout_ms == 0 {
            return Err(invalid("write_timeout_ms must be greater than 0"));
        }
        if network.connect_timeout_ms == Some(0) {
            return Err(invalid("connect_timeout_ms must be greater than 0 when set"));
        }
        if network.outbound_buffer == 0 {
            return Err(invalid("outbound_buffer must be greater than 0"));
        }
        if network.max_frame_bytes == 0 {
            return Err(invalid("max_frame_bytes must be greater than 0"));
        }

        let sync = &self.sync;
        if sync.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms must be greater than 0"));
        }
        if sync.liveness_timeout_ms <= sync.heartbeat_interval_ms {
            return Err(invalid(format!(
                "liveness_timeout_ms ({}) must be greater than heartbeat_interval_ms ({})",
                sync.liveness_timeout_ms, sync.heartbeat_interval_ms
            )));
        }
        if !(MIN_LEAD_MS..=MAX_LEAD_MS).contains(&sync.lead_ms) {
            return Err(invalid(format!(
                "lead_ms ({}) must be between {MIN_LEAD_MS} and {MAX_LEAD_MS}",
                sync.lead_ms
            )));
        }

        if self.node.lens_label.trim().is_empty() {
            return Err(invalid("lens_label must not be empty"));
        }
        Ok(())
    }

    /// Name this node reports, resolving the default from its identity.
    #[must_use]
    pub fn display_name(&self, id: &NodeId) -> String {
        self.node
            .display_name
            .clone()
            .unwrap_or_else(|| format!("node-{}", id.short()))
    }

    /// Address the commander listens on for a given hint.
    #[must_use]
    pub fn listen_addr(&self, hint: ProtocolHint) -> SocketAddr {
        SocketAddr::new(self.network.bind_address, hint.port(&self.network))
    }

    /// Get the connect timeout as a Duration, if set.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.network.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Get the heartbeat interval as a Duration.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.sync.heartbeat_interval_ms)
    }

    /// Liveness timeout in milliseconds, as compared against clock readings.
    #[must_use]
    pub fn liveness_timeout_ms(&self) -> i64 {
        i64::try_from(self.sync.liveness_timeout_ms).unwrap_or(i64::MAX)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
