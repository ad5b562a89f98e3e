//! # edgecache-config
//!
//! Configuration management for edgecache.
//!
//! Loads configuration from:
//! 1. `~/.edgecache/config.toml` (global)
//! 2. `.edgecache/config.toml` (local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! The cache engine crates never read these files themselves. The daemon
//! loads a [`Config`] once and hands plain settings structs to each component.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub eviction: EvictionConfig,
    pub proxy: ProxyConfig,
    pub push: PushConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                layers.push(global_path);
            }
        }

        let local_path = PathBuf::from(".edgecache/config.toml");
        if local_path.exists() {
            debug!("Loading local config from {:?}", local_path);
            layers.push(local_path);
        }

        let mut config = Self::from_layers(&layers)?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse config files in order, later files overriding earlier ones
    /// key by key. Keys a file leaves out keep the earlier value.
    pub fn from_layers(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in paths {
            let contents = std::fs::read_to_string(path)?;
            merge_tables(&mut merged, toml::from_str(&contents)?);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Parse a single config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.edgecache/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".edgecache/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("EDGECACHE_CACHE_DIR") {
            let root = PathBuf::from(dir);
            self.cache.cache_dir = root.join("cache");
            self.cache.staging_dir = root.join("staging");
            self.cache.meta_dir = root.join("meta");
        }
        if let Ok(id) = std::env::var("EDGECACHE_DISPLAY_ID") {
            self.push.display_id = Some(id);
        }
        if let Ok(proxy) = std::env::var("EDGECACHE_PROXY") {
            self.proxy.active = Some(proxy);
        }
        if let Ok(url) = std::env::var("EDGECACHE_PUSH_URL") {
            self.push.url = Some(url);
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Overlay `layer` onto `base`, descending into tables so a section in
/// `layer` only replaces the keys it names.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(section)) => {
                merge_tables(existing, section);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".edgecache")
}

/// On-disk layout and request policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Committed cache files, one per key
    pub cache_dir: PathBuf,
    /// In-progress downloads, never served
    pub staging_dir: PathBuf,
    /// LMDB side-stores (validators, key/value records)
    pub meta_dir: PathBuf,
    /// Free space that must remain after admitting a download
    pub disk_threshold_bytes: u64,
    /// Window during which a validated entry is served without revalidation
    pub staleness_secs: u64,
    /// Limit on the wait for response headers and on each gap between body chunks
    pub request_timeout_secs: u64,
    /// Stamp the access time explicitly when serving from disk
    pub stamp_access_time: bool,
    /// How long a key denied for space stays in cooldown (0 = process lifetime)
    pub space_backoff_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = default_root();
        Self {
            cache_dir: root.join("cache"),
            staging_dir: root.join("staging"),
            meta_dir: root.join("meta"),
            disk_threshold_bytes: 512 * 1024 * 1024,
            staleness_secs: 300,
            request_timeout_secs: 120,
            stamp_access_time: true,
            space_backoff_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn space_backoff(&self) -> Option<Duration> {
        (self.space_backoff_secs > 0).then(|| Duration::from_secs(self.space_backoff_secs))
    }
}

/// Eviction cadence and retention windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub interval_secs: u64,
    /// File-backed entries unused for longer than this are removed
    pub file_retention_secs: u64,
    /// Key/value records older than this are removed
    pub record_retention_secs: u64,
    /// Staging files older than this are treated as crash leftovers
    pub staging_max_age_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            file_retention_secs: 7 * 24 * 60 * 60,
            record_retention_secs: 24 * 60 * 60,
            staging_max_age_secs: 60 * 60,
        }
    }
}

/// Forward proxy for origin requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub active: Option<String>,
    pub fallback: Option<String>,
}

impl ProxyConfig {
    /// The proxy to route through: `active` wins over `fallback`.
    pub fn effective(&self) -> Option<&str> {
        self.active
            .as_deref()
            .or(self.fallback.as_deref())
            .filter(|p| !p.trim().is_empty())
    }
}

/// Push channel endpoint and reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub url: Option<String>,
    pub display_id: Option<String>,
    pub machine_id: Option<String>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
    /// Disconnection is reported only after it lasts this long
    pub offline_grace_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: None,
            display_id: None,
            machine_id: None,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 1.5,
            jitter_ms: 250,
            offline_grace_ms: 5_000,
        }
    }
}
