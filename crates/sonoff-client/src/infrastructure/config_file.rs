//! TOML configuration file.
//!
//! Default location: `$XDG_CONFIG_HOME/sonoff-lan/config.toml`, falling back
//! to `~/.config/sonoff-lan/config.toml`.  Every key is optional:
//!
//! ```toml
//! log_level = "info"
//! api_key = "nonce"
//!
//! [policy]
//! connect_timeout_secs = 10
//! handshake_timeout_secs = 10
//! keepalive_interval_secs = 145
//! keepalive_timeout_factor = 2
//! reconnect_initial_ms = 1000
//! reconnect_max_secs = 60
//! min_stable_session_secs = 10
//!
//! [[devices]]
//! host = "192.168.0.72"
//! port = 8081
//! endpoint = "/"
//! name = "Sonoff Switch"
//! keepalive_secs = 145
//! ```
//!
//! Missing keys take their defaults through `#[serde(default = "...")]`, so
//! an older file keeps loading when new keys are added.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonoff_core::protocol::frame::{DEFAULT_ENDPOINT, DEFAULT_PORT};
use thiserror::Error;

use crate::domain::config::{ClientConfig, ConnectionPolicy, DeviceConfig, DEFAULT_API_KEY};

const APP_DIR: &str = "sonoff-lan";
const FILE_NAME: &str = "config.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither `XDG_CONFIG_HOME` nor `HOME` is set.
    #[error("could not determine config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed, but the values cannot be used.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── File schema ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub devices: Vec<DeviceSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySection {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout_factor")]
    pub keepalive_timeout_factor: u32,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_min_stable_session_secs")]
    pub min_stable_session_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_secs: Option<u64>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_api_key() -> String {
    DEFAULT_API_KEY.to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_keepalive_interval_secs() -> u64 {
    145
}
fn default_keepalive_timeout_factor() -> u32 {
    2
}
fn default_reconnect_initial_ms() -> u64 {
    1000
}
fn default_reconnect_max_secs() -> u64 {
    60
}
fn default_min_stable_session_secs() -> u64 {
    10
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api_key: default_api_key(),
            policy: PolicySection::default(),
            devices: Vec::new(),
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_timeout_factor: default_keepalive_timeout_factor(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            min_stable_session_secs: default_min_stable_session_secs(),
        }
    }
}

// ── Conversion ────────────────────────────────────────────────────────────────

impl ConfigFile {
    /// Validates the file and converts it into a [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero timeouts or intervals, a
    /// zero timeout factor, an empty host or a zero port.
    pub fn into_client_config(self) -> Result<ClientConfig, ConfigError> {
        let policy = self.policy.into_policy()?;
        let devices = self
            .devices
            .into_iter()
            .map(DeviceSection::into_device)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientConfig {
            api_key: self.api_key,
            log_level: self.log_level,
            policy,
            devices,
        })
    }
}

impl PolicySection {
    fn into_policy(self) -> Result<ConnectionPolicy, ConfigError> {
        let nonzero = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("keepalive_timeout_factor", u64::from(self.keepalive_timeout_factor)),
            ("reconnect_initial_ms", self.reconnect_initial_ms),
            ("reconnect_max_secs", self.reconnect_max_secs),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("policy.{key} must be greater than 0")));
        }

        let reconnect_initial = Duration::from_millis(self.reconnect_initial_ms);
        let reconnect_max = Duration::from_secs(self.reconnect_max_secs);
        if reconnect_initial > reconnect_max {
            return Err(ConfigError::Invalid(
                "policy.reconnect_initial_ms exceeds policy.reconnect_max_secs".to_string(),
            ));
        }

        Ok(ConnectionPolicy {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout_factor: self.keepalive_timeout_factor,
            reconnect_initial,
            reconnect_max,
            min_stable_session: Duration::from_secs(self.min_stable_session_secs),
        })
    }
}

impl DeviceSection {
    fn into_device(self) -> Result<DeviceConfig, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("device host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "device {} has port 0",
                self.host
            )));
        }
        if self.keepalive_secs == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "device {} has keepalive_secs = 0",
                self.host
            )));
        }
        Ok(DeviceConfig {
            host: self.host.trim().to_string(),
            port: self.port,
            endpoint: self.endpoint,
            name: self.name,
            keepalive: self.keepalive_secs.map(Duration::from_secs),
        })
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when neither
/// `XDG_CONFIG_HOME` nor `HOME` is set.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok_or(ConfigError::NoPlatformConfigDir)?;
    Ok(base.join(APP_DIR).join(FILE_NAME))
}

/// Parses configuration text.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Invalid`] for
/// unusable values.
pub fn parse_config(text: &str) -> Result<ClientConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(text)?;
    file.into_client_config()
}

/// Loads the configuration.
///
/// With an explicit `path` the file must exist.  Without one the default
/// path is used, and a missing file yields [`ClientConfig::default`].
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors, otherwise as [`parse_config`].
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Ok(path) => (path, false),
            Err(ConfigError::NoPlatformConfigDir) => return Ok(ClientConfig::default()),
            Err(e) => return Err(e),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            Ok(ClientConfig::default())
        }
        Err(source) => Err(ConfigError::Io { path, source }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        // Arrange / Act
        let cfg = parse_config("").unwrap();

        // Assert
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn test_full_file_is_parsed() {
        // Arrange
        let text = r#"
            log_level = "debug"
            api_key = "nonce"

            [policy]
            keepalive_interval_secs = 30
            reconnect_initial_ms = 250

            [[devices]]
            host = "192.168.0.72"
            name = "Lounge"

            [[devices]]
            host = "192.168.0.73"
            port = 9000
            keepalive_secs = 20
        "#;

        // Act
        let cfg = parse_config(text).unwrap();

        // Assert
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.policy.keepalive_interval, Duration::from_secs(30));
        assert_eq!(cfg.policy.reconnect_initial, Duration::from_millis(250));
        assert_eq!(cfg.policy.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cfg.policy.min_stable_session, Duration::from_secs(10));
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].port, 8081);
        assert_eq!(cfg.devices[0].endpoint, "/");
        assert_eq!(cfg.devices[0].name.as_deref(), Some("Lounge"));
        assert_eq!(cfg.devices[1].url(), "ws://192.168.0.73:9000/");
        assert_eq!(cfg.devices[1].keepalive, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        assert!(matches!(
            parse_config("log_level = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_device_without_host_is_parse_error() {
        assert!(matches!(
            parse_config("[[devices]]\nport = 8081\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let zero_factor = parse_config("[policy]\nkeepalive_timeout_factor = 0\n");
        let zero_port = parse_config("[[devices]]\nhost = \"h\"\nport = 0\n");
        let blank_host = parse_config("[[devices]]\nhost = \" \"\n");

        for result in [zero_factor, zero_port, blank_host] {
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_zero_min_stable_session_is_allowed() {
        let cfg = parse_config("[policy]\nmin_stable_session_secs = 0\n").unwrap();
        assert_eq!(cfg.policy.min_stable_session, Duration::ZERO);
    }

    #[test]
    fn test_initial_backoff_above_cap_is_rejected() {
        let result = parse_config("[policy]\nreconnect_initial_ms = 120000\nreconnect_max_secs = 60\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_explicit_missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!("sonoff-lan-missing-{}.toml", uuid::Uuid::new_v4()));

        let result = load_config(Some(&path));

        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_explicit_file_is_loaded() {
        // Arrange
        let path = std::env::temp_dir().join(format!("sonoff-lan-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[[devices]]\nhost = \"10.0.0.9\"\n").unwrap();

        // Act
        let cfg = load_config(Some(&path));
        std::fs::remove_file(&path).unwrap();

        // Assert
        assert_eq!(cfg.unwrap().devices[0].host, "10.0.0.9");
    }

    #[test]
    fn test_default_file_serializes_back_to_toml() {
        let text = toml::to_string_pretty(&ConfigFile::default()).unwrap();
        assert!(text.contains("keepalive_interval_secs = 145"));
        assert_eq!(parse_config(&text).unwrap(), ClientConfig::default());
    }
}
