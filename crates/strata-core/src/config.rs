//! strata.toml server configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rank::Rank;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// System name recorded in every engine superblock.
    #[serde(default = "default_name")]
    pub name: String,
    /// Address other nodes reach this node's control API on.
    #[serde(default = "default_address")]
    pub address: String,
    /// Node control API port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the dRPC sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Nodes running the membership service.
    #[serde(default)]
    pub access_points: Vec<String>,
    #[serde(default)]
    pub fault_domain: Option<String>,
    /// Membership store location (access points only).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Per-host deadline for fanned-out rank operations.
    #[serde(default = "default_control_timeout")]
    pub control_timeout: String,
    /// Interval for convergence polling loops.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Mount point of the engine's persistent storage; holds the superblock.
    pub scm_mount: PathBuf,
    /// Out-of-band rank assignment.
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub log_mask: String,
}

fn default_name() -> String {
    "strata".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    10001
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/strata")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/strata")
}

fn default_control_timeout() -> String {
    "30s".to_string()
}

fn default_poll_interval() -> String {
    "250ms".to_string()
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("system name must not be empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".into()));
        }
        if self.socket_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_dir must not be empty".into()));
        }
        if self.engines.is_empty() {
            return Err(ConfigError::Invalid("at least one engine is required".into()));
        }

        let mut mounts = HashSet::new();
        let mut ranks = HashSet::new();
        for (idx, engine) in self.engines.iter().enumerate() {
            if !mounts.insert(&engine.scm_mount) {
                return Err(ConfigError::Invalid(format!(
                    "engine {idx}: scm_mount {} is used by another engine",
                    engine.scm_mount.display()
                )));
            }
            if let Some(rank) = engine.rank {
                if Rank::new(rank).is_nil() {
                    return Err(ConfigError::Invalid(format!(
                        "engine {idx}: rank {rank} is reserved"
                    )));
                }
                if !ranks.insert(rank) {
                    return Err(ConfigError::Invalid(format!(
                        "engine {idx}: rank {rank} is assigned to another engine"
                    )));
                }
            }
        }

        self.control_timeout()?;
        self.poll_interval()?;
        Ok(())
    }

    pub fn control_timeout(&self) -> ConfigResult<Duration> {
        parse_duration(&self.control_timeout).ok_or_else(|| {
            ConfigError::Invalid(format!("bad control_timeout {:?}", self.control_timeout))
        })
    }

    pub fn poll_interval(&self) -> ConfigResult<Duration> {
        parse_duration(&self.poll_interval).ok_or_else(|| {
            ConfigError::Invalid(format!("bad poll_interval {:?}", self.poll_interval))
        })
    }

    /// `address:port` of this node's control API.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_access_point(&self) -> bool {
        let own = self.control_addr();
        self.access_points.iter().any(|ap| *ap == own)
    }

    /// Socket the control process listens on for worker notifications.
    pub fn server_socket(&self) -> PathBuf {
        self.socket_dir.join("strata_server.sock")
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
