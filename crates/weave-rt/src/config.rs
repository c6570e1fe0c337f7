//! Server configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 9001
//! idle_timeout_secs = 60
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// WebSocket server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub host: String,

    /// Listen port. 0 picks an ephemeral port.
    pub port: u16,

    /// Worker threads for actor handlers. 0 = available cores.
    pub workers: usize,

    /// Seconds a connection may stay silent before it is closed.
    /// 0 disables the timeout.
    pub idle_timeout_secs: u64,

    /// Seconds allowed for the client to send its upgrade request.
    pub handshake_timeout_secs: u64,

    /// Seconds a frame write may block on a peer that stopped reading.
    /// 0 disables the timeout.
    pub write_timeout_secs: u64,

    /// Maximum size of the upgrade request head.
    pub max_handshake_bytes: usize,

    /// Maximum payload of a single frame.
    pub max_frame_bytes: u64,

    /// Maximum size of a reassembled message.
    pub max_message_bytes: usize,

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Write logs here instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 0,
            idle_timeout_secs: 300,
            handshake_timeout_secs: 10,
            write_timeout_secs: 10,
            max_handshake_bytes: 8192,
            max_frame_bytes: 16 * 1024 * 1024,
            max_message_bytes: 64 * 1024 * 1024,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Default configuration listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.socket_addr().is_none() {
            return Err(ConfigError::Invalid(format!(
                "{}:{} is not a valid socket address",
                self.host, self.port
            )));
        }
        if self.max_handshake_bytes < 16 {
            return Err(ConfigError::Invalid(
                "max_handshake_bytes must be at least 16".to_string(),
            ));
        }
        if self.max_frame_bytes < 125 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 125".to_string(),
            ));
        }
        if (self.max_message_bytes as u64) < self.max_frame_bytes {
            return Err(ConfigError::Invalid(format!(
                "max_message_bytes ({}) is smaller than max_frame_bytes ({})",
                self.max_message_bytes, self.max_frame_bytes
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The listen address, if `host` parses as an IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }

    /// Idle timeout, or `None` if disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Write timeout, or `None` if disabled.
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_secs > 0).then(|| Duration::from_secs(self.write_timeout_secs))
    }
}
