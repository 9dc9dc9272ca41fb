//! Client configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default MSG server port
pub const DEFAULT_PORT: u16 = 6868;

/// Errors reading or writing a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No home directory to place the default file in
    #[error("could not determine configuration directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File contents are not valid configuration JSON
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Connection and timing settings for a [`Client`](crate::Client)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,
    /// Server TCP port
    pub port: u16,
    /// Bound on establishing the TCP connection
    pub connect_timeout_ms: u64,
    /// Bound on the whole `lst` handshake
    pub handshake_timeout_ms: u64,
    /// Read-loop liveness checkpoint; not a protocol timeout
    pub read_poll_interval_ms: u64,
    /// How long `stop()` waits for callback tasks to unwind
    pub stop_grace_ms: u64,
    /// Timeout applied to `get`/`run` when the caller passes none
    pub default_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            read_poll_interval_ms: 1_000,
            stop_grace_ms: 500,
            default_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Default settings for a specific endpoint
    pub fn for_endpoint(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` as dialled
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Get the XDG config directory for msgctl
    /// Uses $XDG_CONFIG_HOME/msgctl when set, falls back to ~/.config/msgctl
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("msgctl"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("msgctl"))
    }

    /// Default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load the default configuration file, falling back to defaults when it
    /// is missing or unreadable
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|e| {
                tracing::warn!("Ignoring configuration: {}", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Load configuration from `path`; missing fields take their defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        std::fs::write(path, json).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "host": "mmt-ops", "default_timeout_ms": 30000 }"#).unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.host, "mmt-ops");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.read_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = ClientConfig::for_endpoint("wavefront", 5403);
        config.save_to(&path).unwrap();

        assert_eq!(ClientConfig::load_from(&path).unwrap(), config);
        assert_eq!(config.addr(), "wavefront:5403");
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            ClientConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
