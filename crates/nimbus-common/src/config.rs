//! Configuration types for Nimbus
//!
//! The target reads a TOML file into [`Config`]; every field has a default
//! so partial files are accepted. A handful of fields can be changed at
//! runtime through [`Config::set`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a storage target
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target identity and endpoints
    pub target: TargetConfig,
    /// Mount paths and on-disk layout
    pub storage: StorageConfig,
    /// Cloud backend selection
    pub cloud: CloudConfig,
    /// Name lock tuning
    pub lock: LockConfig,
    /// LRU eviction
    pub lru: LruConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Apply a runtime `setconfig` mutation.
    ///
    /// Only the knobs that are safe to change on a running target are
    /// accepted; anything else is an invalid request.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "lru_enabled" => {
                self.lru.enabled = parse_value(name, value)?;
            }
            "lru_capacity_bytes" => {
                self.lru.capacity_bytes = parse_value(name, value)?;
            }
            "lock_timeout_ms" => {
                let ms: u64 = parse_value(name, value)?;
                if ms == 0 {
                    return Err(Error::invalid_request("lock_timeout_ms must be positive"));
                }
                self.lock.timeout_ms = ms;
            }
            _ => {
                return Err(Error::invalid_request(format!(
                    "cannot set config {name:?} at runtime"
                )));
            }
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_request(format!("invalid value {value:?} for {name}")))
}

/// Target identity and network configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Daemon identifier; derived from hostname and port when absent
    pub daemon_id: Option<String>,
    /// Listen address for the REST API
    pub listen: String,
    /// URL other targets use to reach this one; derived from `listen` when absent
    pub direct_url: Option<String>,
    /// Coordinator base URL; empty disables registration
    pub proxy_url: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            daemon_id: None,
            listen: "0.0.0.0:8081".to_string(),
            direct_url: None,
            proxy_url: String::new(),
        }
    }
}

/// Mount path and layout configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Mount roots, one per physical filesystem
    pub fspaths: Vec<PathBuf>,
    /// Namespace directory for local buckets
    pub local_buckets: String,
    /// Namespace directory for cloud buckets
    pub cloud_buckets: String,
    /// Keep validity attributes in a sidecar tree instead of xattrs
    pub no_xattrs: bool,
    /// Synthetic mount paths for testing on a single filesystem
    pub test_fspaths: TestFspathsConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fspaths: Vec::new(),
            local_buckets: "local".to_string(),
            cloud_buckets: "cloud".to_string(),
            no_xattrs: false,
            test_fspaths: TestFspathsConfig::default(),
        }
    }
}

/// Synthetic mount paths: `count` directories under `root`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestFspathsConfig {
    pub root: PathBuf,
    pub count: usize,
    /// Instance subdirectory of `root` so several targets can share a host
    pub instance: usize,
}

impl TestFspathsConfig {
    /// Whether synthetic mount paths are in use
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.count > 0
    }
}

/// Cloud vendor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    Aws,
    Gcp,
}

/// Cloud backend configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub provider: CloudProvider,
    /// Base endpoint; vendor default when empty
    pub endpoint: String,
    /// Optional bearer token sent with every request
    pub bearer_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: CloudProvider::Aws,
            endpoint: String::new(),
            bearer_token: None,
            timeout_secs: 60,
        }
    }
}

/// Name lock configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long a request waits for a conflicting holder
    pub timeout_ms: u64,
}

impl LockConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_ms: 1000 }
    }
}

/// LRU eviction configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LruConfig {
    pub enabled: bool,
    /// Byte budget for cached cloud objects (0 = unlimited)
    pub capacity_bytes: u64,
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
