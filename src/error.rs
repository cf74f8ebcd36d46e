//! Error types for the chat server
//!
//! Defines application-level errors and outbound send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Per-connection I/O problems never show up here: the handler turns them
/// into a Leave, and failed accepts are retried. What remains is bind, config
/// and internal failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (bind, config file read)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A config value is out of range
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Channel send error (fatal - coordinator is gone)
    #[error("Channel send error")]
    ChannelSend,

    /// Config file could not be parsed
    #[error("Invalid config file {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Outbound send errors
///
/// Occurs when queueing a line for a connection whose writer has stopped.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
