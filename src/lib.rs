//! Multi-client TCP Broadcast Chat Server Library
//!
//! A line-oriented chat server built on tokio, using the Actor pattern for
//! the shared client registry.
//!
//! # Features
//! - Plain-text, newline-delimited protocol (works with `nc` or `telnet`)
//! - Display name handshake with address fallback
//! - `help`, `time`, `clients`, `quit` commands
//! - Chat broadcast to every joined client, sender included
//! - Join/leave announcements
//! - Graceful drain on SIGINT/SIGTERM
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the single owner of the client registry
//! - Each connection has a `handler` task that reads lines and sends events
//! - Each connection has a writer task draining its outbound line queue
//! - No locks needed - all registry access goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use broadcast_chat::{serve, shutdown_signal, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let listener = TcpListener::bind(config.bind_addr()).await.unwrap();
//!     serve(listener, config, shutdown_signal()).await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::{ServerConfig, SessionConfig};
pub use error::{AppError, SendError};
pub use handler::handle_connection;
pub use listener::serve;
pub use message::{Command, Outbound};
pub use registry::Registry;
pub use server::{ChatEvent, ChatServer, JoinOutcome};
pub use shutdown::{shutdown_signal, DrainReport, ShutdownCoordinator, ShutdownState};
pub use types::ClientId;
