//! Configuration management for Lanlink.
//!
//! This module handles loading, saving, and managing Lanlink configuration.
//! Each service receives its own section as a plain value at construction;
//! nothing here is global.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/lanlink/config.toml` |
//! | macOS | `~/Library/Application Support/com.lanlink.Lanlink/config.toml` |
//! | Windows | `%APPDATA%\lanlink\Lanlink\config\config.toml` |
//!
//! ## Environment Overrides
//!
//! `LANLINK_NAME`, `LANLINK_DISCOVERY_PORT` and `LANLINK_TRANSPORT_PORT`
//! override the file when [`Config::apply_env`] is called.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanlink_core::config::Config;
//!
//! let mut config = Config::load()?;
//! if config.ensure_identity() {
//!     config.save()?;
//! }
//! println!("Display name: {}", config.identity.display_name);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Room kept in a frame for envelope fields around a chunk.
const CHUNK_HEADROOM: usize = 4096;

/// Main configuration struct for Lanlink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local identity
    pub identity: IdentityConfig,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
    /// Transport settings
    pub transport: TransportConfig,
    /// File transfer settings
    pub transfer: TransferConfig,
}

/// Identity of the local peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable peer id, generated on first run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Display name on the network
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            display_name: hostname::get().map_or_else(
                |_| "Lanlink Peer".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
        }
    }
}

/// Discovery configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery port (UDP)
    pub port: u16,
    /// Address the discovery socket binds to
    pub bind_address: IpAddr,
    /// Destination address of presence broadcasts
    pub broadcast_address: IpAddr,
    /// Destination port of presence broadcasts (defaults to `port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_port: Option<u16>,
    /// Interval between presence broadcasts
    #[serde(with = "humantime_serde")]
    pub broadcast_interval: Duration,
    /// Silence after which a peer is considered gone
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_DISCOVERY_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_port: None,
            broadcast_interval: Duration::from_millis(crate::DEFAULT_BROADCAST_INTERVAL_MS),
            peer_timeout: Duration::from_millis(crate::DEFAULT_PEER_TIMEOUT_MS),
        }
    }
}

impl DiscoveryConfig {
    /// Address the discovery socket binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Where presence broadcasts are sent.
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(
            self.broadcast_address,
            self.broadcast_port.unwrap_or(self.port),
        )
    }
}

/// Transport configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Listening port (TCP)
    pub port: u16,
    /// Address the listener binds to
    pub bind_address: IpAddr,
    /// Largest accepted frame payload in bytes
    pub max_message_size: usize,
    /// Time allowed for an outbound connect
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_TRANSPORT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Address the listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// File transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Pause between chunks
    #[serde(with = "humantime_serde")]
    pub chunk_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(crate::DEFAULT_CHUNK_DELAY_MS),
        }
    }
}

/// The local peer's id and display name, as handed to the services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Stable peer id
    pub id: String,
    /// Display name
    pub name: String,
}

impl LocalIdentity {
    /// Create an identity.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Create an identity with a fresh random id.
    #[must_use]
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), name)
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file, or defaults if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "lanlink", "Lanlink")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Generate a peer id if none is set. Returns `true` if one was generated.
    pub fn ensure_identity(&mut self) -> bool {
        let missing = self
            .identity
            .peer_id
            .as_deref()
            .map_or(true, |id| id.trim().is_empty());
        if missing {
            self.identity.peer_id = Some(Uuid::new_v4().to_string());
        }
        missing
    }

    /// The local identity handed to the services.
    ///
    /// # Errors
    ///
    /// Returns an error if no peer id has been assigned yet.
    pub fn local_identity(&self) -> Result<LocalIdentity> {
        let id = self
            .identity
            .peer_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                key: "identity.peer_id".to_string(),
                reason: "no peer id assigned".to_string(),
            })?;
        Ok(LocalIdentity::new(id, self.identity.display_name.clone()))
    }

    /// Apply `LANLINK_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("LANLINK_NAME") {
            self.identity.display_name = name;
        }
        if let Some(port) = lookup("LANLINK_DISCOVERY_PORT") {
            self.discovery.port = parse_port("LANLINK_DISCOVERY_PORT", &port)?;
        }
        if let Some(port) = lookup("LANLINK_TRANSPORT_PORT") {
            self.transport.port = parse_port("LANLINK_TRANSPORT_PORT", &port)?;
        }
        Ok(())
    }

    /// Check values that would make the services misbehave.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: String| Error::InvalidConfig {
            key: key.to_string(),
            reason,
        };

        if self.identity.display_name.trim().is_empty() {
            return Err(invalid(
                "identity.display_name",
                "must not be empty".to_string(),
            ));
        }
        if self.transport.max_message_size == 0 {
            return Err(invalid(
                "transport.max_message_size",
                "must be positive".to_string(),
            ));
        }
        let max_chunk = self.transport.max_message_size.saturating_sub(CHUNK_HEADROOM);
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > max_chunk {
            return Err(invalid(
                "transfer.chunk_size",
                format!("must be between 1 and {max_chunk}"),
            ));
        }
        if self.discovery.peer_timeout.is_zero() {
            return Err(invalid(
                "discovery.peer_timeout",
                "must be positive".to_string(),
            ));
        }
        if self.discovery.peer_timeout <= self.discovery.broadcast_interval {
            return Err(invalid(
                "discovery.peer_timeout",
                "must be longer than discovery.broadcast_interval".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value.trim().parse().map_err(|_| Error::InvalidConfig {
        key: key.to_string(),
        reason: format!("'{value}' is not a port number"),
    })
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.discovery.port, 8888);
        assert_eq!(config.transport.port, 9999);
        assert_eq!(config.discovery.broadcast_interval, Duration::from_millis(5000));
        assert_eq!(config.discovery.peer_timeout, Duration::from_millis(15000));
        assert_eq!(config.transport.max_message_size, 20 * 1024 * 1024);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert!(config.identity.peer_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broadcast_target_defaults_to_port() {
        let mut discovery = DiscoveryConfig::default();
        assert_eq!(
            discovery.broadcast_target(),
            "255.255.255.255:8888".parse::<SocketAddr>().unwrap()
        );

        discovery.broadcast_port = Some(9000);
        assert_eq!(discovery.broadcast_target().port(), 9000);
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.identity.display_name = "Test Peer".to_string();
        original.ensure_identity();
        original.discovery.port = 12345;
        original.discovery.broadcast_interval = Duration::from_millis(250);
        original.transfer.chunk_size = 32 * 1024;

        original.save_to(&config_path).expect("save");
        let loaded = Config::load_from(&config_path).expect("load");

        assert_eq!(loaded.identity.display_name, "Test Peer");
        assert_eq!(loaded.identity.peer_id, original.identity.peer_id);
        assert_eq!(loaded.discovery.port, 12345);
        assert_eq!(loaded.discovery.broadcast_interval, Duration::from_millis(250));
        assert_eq!(loaded.transfer.chunk_size, 32 * 1024);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.transport.port, crate::DEFAULT_TRANSPORT_PORT);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[discovery\nport = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[identity]
display_name = "Kitchen Laptop"

[discovery]
port = 7777
peer_timeout = "30s"
broadcast_interval = "1500ms"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.identity.display_name, "Kitchen Laptop");
        assert_eq!(config.discovery.port, 7777);
        assert_eq!(config.discovery.peer_timeout, Duration::from_secs(30));
        assert_eq!(config.discovery.broadcast_interval, Duration::from_millis(1500));
        assert_eq!(config.transport.port, crate::DEFAULT_TRANSPORT_PORT);
    }

    #[test]
    fn test_duration_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");

        assert!(toml_str.contains("broadcast_interval = \"5s\""));
        assert!(toml_str.contains("chunk_delay = \"10ms\""));
    }

    #[test]
    fn test_ensure_identity_is_stable() {
        let mut config = Config::default();
        assert!(config.local_identity().is_err());

        assert!(config.ensure_identity());
        let first = config.local_identity().expect("identity");
        assert!(!config.ensure_identity());
        assert_eq!(config.local_identity().expect("identity"), first);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LANLINK_NAME", "Override"),
            ("LANLINK_DISCOVERY_PORT", "4000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(ToString::to_string))
            .expect("apply");

        assert_eq!(config.identity.display_name, "Override");
        assert_eq!(config.discovery.port, 4000);
        assert_eq!(config.transport.port, crate::DEFAULT_TRANSPORT_PORT);
    }

    #[test]
    fn test_override_invalid_port() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == "LANLINK_TRANSPORT_PORT").then(|| "http".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.chunk_size = config.transport.max_message_size;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.peer_timeout = config.discovery.broadcast_interval;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identity.display_name = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
