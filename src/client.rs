//! Client struct definition
//!
//! Represents a registered connection: its identity, display name, remote
//! address, and the outbound channel its writer task drains.

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::Outbound;
use crate::types::ClientId;

/// Registered client information
///
/// Built by the connection handler once the name handshake is done and
/// handed to the coordinator in a Join event. The coordinator never touches
/// the socket itself, only this channel.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Display name chosen at registration
    pub name: String,
    /// Remote address, as reported by the listener
    pub peer_addr: String,
    /// Server → Client line channel
    pub sender: mpsc::UnboundedSender<Outbound>,
}

impl Client {
    /// Create a new client with the given identity and sender channel
    pub fn new(
        id: ClientId,
        name: String,
        peer_addr: String,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            name,
            peer_addr,
            sender,
        }
    }

    /// Queue an outbound item for this client
    ///
    /// Never blocks. Returns an error if the writer task has stopped
    /// (client disconnected or connection already closed).
    pub fn send(&self, msg: Outbound) -> Result<(), SendError> {
        self.sender.send(msg).map_err(|_| SendError::ChannelClosed)
    }

    /// Queue one text line
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), SendError> {
        self.send(Outbound::Line(line.into()))
    }

    /// Ask the writer task to shut the connection down
    pub fn close(&self) -> Result<(), SendError> {
        self.send(Outbound::Close)
    }
}
