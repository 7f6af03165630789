//! Configuration system for drift.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DRIFT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/drift/config.toml
//!   3. ~/.config/drift/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known coordination store prefix under which supernodes publish themselves.
pub const DEFAULT_KEY_PREFIX: &str = "/standby/supernode/";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub node: NodeConfig,
    pub ha: HaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address other peers and supernodes use to reach this node.
    pub advertise_ip: String,
    /// Hostname published in the membership record. Empty = $HOSTNAME.
    pub hostname: String,
    /// Address the HTTP and control listeners bind to.
    pub bind_ip: String,
    /// Peer-facing HTTP port (register, pull, report, service down).
    pub listen_port: u16,
    /// Port peers download pieces from.
    pub download_port: u16,
    /// Control-channel port used by other supernodes.
    pub control_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Run as a member of a supernode cluster.
    pub enabled: bool,
    /// Base URLs of a supernode hosting the coordination store. The first
    /// that answers is used for the life of the process.
    /// Empty = use an embedded store in this process.
    pub store_endpoints: Vec<String>,
    /// Host the embedded coordination store on the control port.
    pub serve_store: bool,
    /// Key prefix for membership records.
    pub key_prefix: String,
    /// Lease TTL in seconds.
    pub lease_ttl_secs: i64,
    /// Timeout for dialing a remote supernode's control port.
    pub dial_timeout_ms: u64,
    /// Upper bound on the service-down notification to a CDN owner.
    pub notify_timeout_ms: u64,
    /// Connect to every discovered supernode while listing, failing the
    /// whole listing if any of them is unreachable.
    pub strict_connect: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            advertise_ip: "127.0.0.1".to_string(),
            hostname: String::new(),
            bind_ip: "0.0.0.0".to_string(),
            listen_port: 8002,
            download_port: 8001,
            control_port: 8005,
        }
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_endpoints: Vec::new(),
            serve_store: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lease_ttl_secs: 2,
            dial_timeout_ms: 10_000,
            notify_timeout_ms: 5_000,
            strict_connect: false,
        }
    }
}

impl NodeConfig {
    /// Hostname to advertise: configured value, else $HOSTNAME, else "localhost".
    pub fn resolved_hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

impl HaConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("drift")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DriftConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a config file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(DriftConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DRIFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&DriftConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply DRIFT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DRIFT_NODE__ADVERTISE_IP") {
            self.node.advertise_ip = v;
        }
        if let Ok(v) = std::env::var("DRIFT_NODE__HOSTNAME") {
            self.node.hostname = v;
        }
        if let Some(p) = env_parse("DRIFT_NODE__LISTEN_PORT") {
            self.node.listen_port = p;
        }
        if let Some(p) = env_parse("DRIFT_NODE__DOWNLOAD_PORT") {
            self.node.download_port = p;
        }
        if let Some(p) = env_parse("DRIFT_NODE__CONTROL_PORT") {
            self.node.control_port = p;
        }
        if let Ok(v) = std::env::var("DRIFT_HA__ENABLED") {
            self.ha.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DRIFT_HA__SERVE_STORE") {
            self.ha.serve_store = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DRIFT_HA__STORE_ENDPOINTS") {
            self.ha.store_endpoints = split_endpoints(&v);
        }
        if let Some(ttl) = env_parse("DRIFT_HA__LEASE_TTL_SECS") {
            self.ha.lease_ttl_secs = ttl;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
