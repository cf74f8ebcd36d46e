//! Server configuration
//!
//! Loaded from an optional TOML file. Every field has a default, so the
//! server runs without any file at all.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Full server configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// TCP port to bind
    pub port: u16,
    /// Name shown in the welcome banner
    pub server_name: String,
    /// Upper bound on how long the drain waits for connections to finish
    pub grace_period_secs: u64,
    /// Longest accepted input line in bytes; longer lines end the session
    pub max_line_length: usize,
    /// Capacity of the coordinator's event queue
    pub event_buffer: usize,
    /// Admission limit (None = unbounded)
    pub max_clients: Option<usize>,
    /// Disconnect clients silent for this long (None = never)
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            server_name: "RISC-V Network Server".into(),
            grace_period_secs: 5,
            max_line_length: 4096,
            event_buffer: 256,
            max_clients: None,
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Read, parse and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text).map_err(|source| AppError::Config {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from TOML text
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.event_buffer == 0 {
            return Err(AppError::InvalidConfig(
                "event_buffer must be at least 1".into(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(AppError::InvalidConfig(
                "max_line_length must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` string for the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// How long the drain waits for connections to close
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// The part of the config each connection handler needs
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            server_name: self.server_name.clone(),
            max_line_length: self.max_line_length,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name shown in the welcome banner
    pub server_name: String,
    /// Longest accepted input line in bytes
    pub max_line_length: usize,
    /// Disconnect after this long without input
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        ServerConfig::default().session()
    }
}
