//! Server configuration.
//!
//! Loaded from a RON file; every field has a default so a partial file (or
//! no file at all) is valid. Command-line flags are applied on top by the
//! binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudsftp_backend::TransportOptions;
use cloudsftp_vfs::DEFAULT_MAX_OBJECT_BYTES;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_KEY_CACHE_TTL_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_SSH_PORT,
};

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("RON encode error: {0}")]
    Encode(#[from] ron::Error),
    #[error("Validation failed: {0}")]
    Invalid(String),
}

/// How SSH logins are turned into backend identities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Impersonate with the configured machine key, then require the offered
    /// key to be one of the `.pub` files in the user's personal space.
    #[default]
    PublicKey,
    /// Impersonate with the SSH password as the machine secret. Trusts any
    /// username the secret holder presents.
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway RPC endpoint.
    pub address: String,
    pub machine_auth_api_key: String,
    /// Skip TLS certificate verification for RPC and data transfers.
    pub insecure: bool,
    pub request_timeout_secs: u64,
    /// Largest file an open handle will buffer. Every open file is held
    /// whole in memory, so this bounds per-handle memory use.
    pub max_object_bytes: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "https://127.0.0.1:9142".to_string(),
            machine_auth_api_key: String::new(),
            insecure: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
        }
    }
}

impl GatewayConfig {
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_secs(self.request_timeout_secs),
            insecure: self.insecure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Seconds a user's loaded key set is reused. 0 disables caching.
    pub key_cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            key_cache_ttl_secs: DEFAULT_KEY_CACHE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub pretty: bool,
    pub color: bool,
    /// Also append logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            pretty: false,
            color: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// OpenSSH private key; generated on first start when missing.
    pub host_key_path: PathBuf,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        let ip: IpAddr = DEFAULT_BIND_ADDRESS
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self {
            bind_addr: SocketAddr::from((ip, DEFAULT_SSH_PORT)),
            host_key_path: PathBuf::from("ssh_host_ed25519_key"),
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Parse a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Config = ron::from_str(text)?;
        Ok(config)
    }

    /// Load from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        Ok(text)
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.address.is_empty() {
            return Err(ConfigError::Invalid("gateway.address is empty".into()));
        }
        if self.auth.mode == AuthMode::PublicKey && self.gateway.machine_auth_api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway.machine_auth_api_key is required in public_key mode".into(),
            ));
        }
        if self.gateway.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.request_timeout_secs must be positive".into(),
            ));
        }
        if self.gateway.max_object_bytes == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_object_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.key_cache_ttl_secs)
    }
}
