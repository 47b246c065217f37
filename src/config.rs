//! Server configuration.
//!
//! A deployment file carries one `[server]` table and a `[clusters.<mode>]`
//! table per environment; `server.run_mode` picks the cluster:
//!
//! ```toml
//! [server]
//! run_mode = "dev"
//! bind_address = ":13000"
//! compress = "snappy"
//!
//! [clusters.dev]
//! registry = "local://"
//! process_timeout = 5      # seconds
//! idle_timeout = 300       # seconds
//! max_dispatcher_size = 8000
//! ```
//!
//! Zero or negative numbers fall back to the defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, WireError};
use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:13000";
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_DISPATCHER_SIZE: usize = 8000;
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_WRITE_CHANNEL_SIZE: usize = 1000;
pub const DEFAULT_STAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CLIENT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Body compression applied to outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Snappy,
}

impl Compression {
    pub fn is_enabled(self) -> bool {
        self == Compression::Snappy
    }

    fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "snappy" => Ok(Compression::Snappy),
            "none" | "off" => Ok(Compression::None),
            other => Err(WireError::Config(format!("unknown compression: {}", other))),
        }
    }
}

impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Compression::parse(&name).map_err(serde::de::Error::custom)
    }
}

/// Effective settings of a running server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub compress: Compression,
    pub max_frame_length: u32,
    /// Budget given to every request received by this server.
    #[serde(deserialize_with = "seconds")]
    pub process_timeout: Duration,
    /// Connections quiet for this long are closed.
    #[serde(deserialize_with = "seconds")]
    pub idle_timeout: Duration,
    /// Worker pool size.
    pub max_dispatcher_size: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub write_channel_size: usize,
    #[serde(deserialize_with = "seconds")]
    pub stat_interval: Duration,
    #[serde(deserialize_with = "seconds")]
    pub client_sweep_interval: Duration,
    /// Registry address, informational for the embedding process.
    pub registry: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            compress: Compression::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_dispatcher_size: DEFAULT_MAX_DISPATCHER_SIZE,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            write_channel_size: DEFAULT_WRITE_CHANNEL_SIZE,
            stat_interval: DEFAULT_STAT_INTERVAL,
            client_sweep_interval: DEFAULT_CLIENT_SWEEP_INTERVAL,
            registry: String::new(),
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// `[server]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub run_mode: String,
    pub bind_address: String,
    pub compress: String,
}

/// One `[clusters.<mode>]` table, as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub registry: String,
    pub process_timeout: i64,
    pub idle_timeout: i64,
    pub max_dispatcher_size: i64,
    pub read_buffer_size: i64,
    pub write_buffer_size: i64,
    pub write_channel_size: i64,
    pub max_frame_length: i64,
    pub stat_interval: i64,
    pub client_sweep_interval: i64,
}

/// A parsed deployment file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Options {
    pub server: ServerSection,
    pub clusters: HashMap<String, ClusterSection>,
}

impl Options {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WireError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| WireError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Resolve the settings for `server.run_mode`.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mode = &self.server.run_mode;
        let cluster = self.clusters.get(mode).ok_or_else(|| {
            WireError::Config(format!("no cluster configured for run mode {:?}", mode))
        })?;

        Ok(ServerConfig {
            bind_address: normalize_bind_address(&self.server.bind_address),
            compress: Compression::parse(&self.server.compress)?,
            max_frame_length: positive(cluster.max_frame_length, DEFAULT_MAX_FRAME_LENGTH),
            process_timeout: positive_secs(cluster.process_timeout, DEFAULT_PROCESS_TIMEOUT),
            idle_timeout: positive_secs(cluster.idle_timeout, DEFAULT_IDLE_TIMEOUT),
            max_dispatcher_size: positive(cluster.max_dispatcher_size, DEFAULT_MAX_DISPATCHER_SIZE),
            read_buffer_size: positive(cluster.read_buffer_size, DEFAULT_BUFFER_SIZE),
            write_buffer_size: positive(cluster.write_buffer_size, DEFAULT_BUFFER_SIZE),
            write_channel_size: positive(cluster.write_channel_size, DEFAULT_WRITE_CHANNEL_SIZE),
            stat_interval: positive_secs(cluster.stat_interval, DEFAULT_STAT_INTERVAL),
            client_sweep_interval: positive_secs(
                cluster.client_sweep_interval,
                DEFAULT_CLIENT_SWEEP_INTERVAL,
            ),
            registry: cluster.registry.clone(),
        })
    }
}

fn positive<T: TryFrom<i64>>(value: i64, default: T) -> T {
    if value <= 0 {
        return default;
    }
    T::try_from(value).unwrap_or(default)
}

fn positive_secs(value: i64, default: Duration) -> Duration {
    if value <= 0 {
        default
    } else {
        Duration::from_secs(value as u64)
    }
}

/// `":port"` binds every interface; an empty address takes the default.
fn normalize_bind_address(address: &str) -> String {
    let address = address.trim();
    if address.is_empty() {
        return DEFAULT_BIND_ADDRESS.to_string();
    }
    match address.rsplit_once(':') {
        Some(("", port)) => format!("0.0.0.0:{}", port),
        _ => address.to_string(),
    }
}
