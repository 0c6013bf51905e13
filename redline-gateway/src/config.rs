//! Gateway configuration: built-in defaults merged with a user TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use redline_core::SyncConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Full gateway configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Core synchronization knobs.
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("default gateway config to parse")
    }
}

impl GatewayConfig {
    /// Overlays `other` on top of `self`.
    ///
    /// Zero/empty values in `other` are treated as "not set" for the fields
    /// where that is unambiguous, so a sparse user file only overrides what
    /// it mentions.
    pub fn merge(&mut self, other: &Self) {
        self.server.merge(&other.server);
        merge_sync(&mut self.sync, &other.sync);
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Preferred port; the gateway probes upward when it is occupied.
    pub port: u16,
}

impl ServerConfig {
    fn merge(&mut self, other: &Self) {
        if !other.host.is_empty() {
            self.host.clone_from(&other.host);
        }
        if other.port > 0 {
            self.port = other.port;
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}

fn merge_sync(base: &mut SyncConfig, other: &SyncConfig) {
    if other.max_connections_per_session > 0 {
        base.max_connections_per_session = other.max_connections_per_session;
    }
    if other.max_events_per_session > 0 {
        base.max_events_per_session = other.max_events_per_session;
    }
    if other.default_ttl_hours > 0.0 {
        base.default_ttl_hours = other.default_ttl_hours;
    }
    base.gap_warn_threshold = other.gap_warn_threshold;
    base.gap_critical_threshold = other.gap_critical_threshold;
    if !other.min_supported_client_version.is_empty() {
        base.min_supported_client_version
            .clone_from(&other.min_supported_client_version);
    }
    if other.keepalive_secs > 0 {
        base.keepalive_secs = other.keepalive_secs;
    }
    if other.tail_buffer > 0 {
        base.tail_buffer = other.tail_buffer;
    }
    if other.prune_interval_secs > 0 {
        base.prune_interval_secs = other.prune_interval_secs;
    }
    if other.session_idle_timeout_secs > 0 {
        base.session_idle_timeout_secs = other.session_idle_timeout_secs;
    }
}

/// Loads, edits, and persists the gateway configuration file.
pub struct ConfigManager {
    path: PathBuf,
    config: GatewayConfig,
}

impl ConfigManager {
    /// Loads from the default per-user location.
    pub fn load() -> Result<Self> {
        let path = default_config_path()?;
        Self::load_with_path(path)
    }

    /// Loads from an explicit path, layering the user file (when present)
    /// over the built-in defaults.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut config = GatewayConfig::default();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user_config: GatewayConfig = toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            config.merge(&user_config);
        }

        Ok(Self { path, config })
    }

    /// Effective configuration after merging.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Path this manager reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the effective configuration back to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let toml = toml::to_string_pretty(&self.config)?;
        fs::write(&self.path, toml)
            .with_context(|| format!("failed to write config to {}", self.path.display()))?;
        Ok(())
    }

    /// Reads one dotted-path key as a display string.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "server.host" => Some(self.config.server.host.clone()),
            "server.port" => Some(self.config.server.port.to_string()),
            "sync.max_connections_per_session" => {
                Some(self.config.sync.max_connections_per_session.to_string())
            }
            "sync.max_events_per_session" => {
                Some(self.config.sync.max_events_per_session.to_string())
            }
            "sync.default_ttl_hours" => Some(self.config.sync.default_ttl_hours.to_string()),
            "sync.gap_warn_threshold" => Some(self.config.sync.gap_warn_threshold.to_string()),
            "sync.gap_critical_threshold" => {
                Some(self.config.sync.gap_critical_threshold.to_string())
            }
            "sync.min_supported_client_version" => {
                Some(self.config.sync.min_supported_client_version.clone())
            }
            _ => None,
        }
    }

    /// Sets one dotted-path key from a string value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server.host" => {
                self.config.server.host = value.to_string();
                Ok(())
            }
            "server.port" => {
                self.config.server.port = parse_number(key, value)?;
                Ok(())
            }
            "sync.max_connections_per_session" => {
                self.config.sync.max_connections_per_session = parse_number(key, value)?;
                Ok(())
            }
            "sync.max_events_per_session" => {
                self.config.sync.max_events_per_session = parse_number(key, value)?;
                Ok(())
            }
            "sync.default_ttl_hours" => {
                self.config.sync.default_ttl_hours = parse_number(key, value)?;
                Ok(())
            }
            "sync.gap_warn_threshold" => {
                self.config.sync.gap_warn_threshold = parse_number(key, value)?;
                Ok(())
            }
            "sync.gap_critical_threshold" => {
                self.config.sync.gap_critical_threshold = parse_number(key, value)?;
                Ok(())
            }
            "sync.min_supported_client_version" => {
                semver::Version::parse(value)
                    .with_context(|| format!("'{value}' is not valid semver"))?;
                self.config.sync.min_supported_client_version = value.to_string();
                Ok(())
            }
            _ => Err(anyhow!("unknown configuration key: {key}")),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value '{value}' for {key}"))
}

fn default_config_path() -> Result<PathBuf> {
    let base =
        dirs::config_dir().ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
    Ok(base.join("redline").join("config.toml"))
}
