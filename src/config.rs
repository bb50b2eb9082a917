//! Engine configuration
//!
//! ```toml
//! network = "mainnet"
//! api_url = "https://api.example.org"
//! # socket_url = "wss://api.example.org/socket"
//! link_base_url = "https://link.example.org"
//! reconnect_interval_ms = 5000
//! auth = "auto"
//! ```
//!
//! Only `network` is required. Missing endpoints are reported as
//! `UnknownEndpoint` when something first needs them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::transport::{TransportError, TransportResult};

/// Link base used when none is configured
pub const DEFAULT_LINK_BASE: &str = "tether://link";

/// Config errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {reason}")]
    Io {
        /// Path of the file
        path: String,
        /// OS error text
        reason: String,
    },

    /// Contents are not a valid config
    #[error("Invalid config: {0}")]
    Parse(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Whether the engine authenticates on its own
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Create a session whenever a device is present
    #[default]
    Auto,
    /// Only on explicit `create_session`
    Manual,
}

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Network identifier carried in secure-link challenges
    pub network: String,
    /// Backend base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Relay endpoint; derived from `api_url` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
    /// Base URL for out-of-band links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_base_url: Option<String>,
    /// Reconnect period after an unexpected drop; no reconnect when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_ms: Option<u64>,
    /// Authentication mode
    #[serde(default)]
    pub auth: AuthMode,
}

impl Config {
    /// Minimal config for a network
    pub fn new(network: impl Into<String>) -> Self {
        Config {
            network: network.into(),
            api_url: None,
            socket_url: None,
            link_base_url: None,
            reconnect_interval_ms: None,
            auth: AuthMode::Auto,
        }
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Relay endpoint: `socket_url`, else `api_url` with `http` swapped for
    /// `ws` and `/socket` appended
    pub fn socket_endpoint(&self) -> TransportResult<String> {
        if let Some(url) = &self.socket_url {
            return Ok(url.clone());
        }

        let api = self
            .api_url
            .as_deref()
            .ok_or_else(|| TransportError::UnknownEndpoint("no api_url or socket_url".into()))?;
        let ws = if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(TransportError::UnknownEndpoint(api.to_string()));
        };

        Ok(format!("{}/socket", ws.trim_end_matches('/')))
    }

    /// Base for link URLs
    pub fn link_base(&self) -> &str {
        self.link_base_url.as_deref().unwrap_or(DEFAULT_LINK_BASE)
    }

    /// Reconnect interval, if enabled
    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let config = Config::from_toml_str(
            r#"
            network = "mainnet"
            api_url = "https://api.example.org"
            link_base_url = "https://link.example.org"
            reconnect_interval_ms = 2500
            auth = "manual"
            "#,
        )
        .unwrap();

        assert_eq!(config.network, "mainnet");
        assert_eq!(config.auth, AuthMode::Manual);
        assert_eq!(config.reconnect_interval(), Some(Duration::from_millis(2500)));
        assert_eq!(config.link_base(), "https://link.example.org");
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str(r#"network = "sepolia""#).unwrap();

        assert_eq!(config, Config::new("sepolia"));
        assert_eq!(config.auth, AuthMode::Auto);
        assert_eq!(config.reconnect_interval(), None);
        assert_eq!(config.link_base(), DEFAULT_LINK_BASE);
    }

    #[test]
    fn test_missing_network_rejected() {
        assert!(matches!(
            Config::from_toml_str(r#"api_url = "https://x""#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_socket_endpoint_derivation() {
        let mut config = Config::new("mainnet");
        assert!(matches!(
            config.socket_endpoint(),
            Err(TransportError::UnknownEndpoint(_))
        ));

        config.api_url = Some("https://api.example.org/".to_string());
        assert_eq!(config.socket_endpoint().unwrap(), "wss://api.example.org/socket");

        config.api_url = Some("http://localhost:8080".to_string());
        assert_eq!(config.socket_endpoint().unwrap(), "ws://localhost:8080/socket");

        config.socket_url = Some("wss://relay.example.org".to_string());
        assert_eq!(config.socket_endpoint().unwrap(), "wss://relay.example.org");
    }

    #[test]
    fn test_unsupported_scheme() {
        let mut config = Config::new("mainnet");
        config.api_url = Some("ftp://api.example.org".to_string());
        assert!(matches!(
            config.socket_endpoint(),
            Err(TransportError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "network = \"mainnet\"\nreconnect_interval_ms = 0\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.reconnect_interval(), None);

        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_settings_json_roundtrip() {
        let mut config = Config::new("mainnet");
        config.api_url = Some("https://api.example.org".to_string());

        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("socket_url").is_none());
        assert_eq!(serde_json::from_value::<Config>(json).unwrap(), config);
    }
}
