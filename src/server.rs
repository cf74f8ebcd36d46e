//! ChatServer Actor implementation
//!
//! The broadcast coordinator. Owns the client registry and consumes chat
//! events one at a time, in arrival order. Every registry mutation and every
//! broadcast happens here, so nothing needs a lock.

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::message;
use crate::registry::Registry;
use crate::types::ClientId;

/// Events sent from connection handlers to the ChatServer actor
#[derive(Debug)]
pub enum ChatEvent {
    /// Client finished the name handshake and wants in
    Join {
        client: Client,
        reply: oneshot::Sender<JoinOutcome>,
    },
    /// Client is gone
    Leave {
        client_id: ClientId,
    },
    /// Chat line to broadcast
    Message {
        name: String,
        text: String,
        sent_at: DateTime<Local>,
    },
    /// Snapshot of registered display names
    ListClients {
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Notify and close every client, refuse later joins
    Drain {
        reply: oneshot::Sender<usize>,
    },
}

/// Answer to a Join event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Client is now registered
    Accepted,
    /// Drain has started; the client must be closed
    ShuttingDown,
    /// Admission limit reached
    Full,
    /// Another registered client already has this id
    DuplicateId,
}

/// The main ChatServer actor
pub struct ChatServer {
    /// Joined clients
    registry: Registry,
    /// Optional admission limit
    max_clients: Option<usize>,
    /// Set once by the first Drain event, never reset
    draining: bool,
    /// Event receiver channel
    receiver: mpsc::Receiver<ChatEvent>,
}

impl ChatServer {
    /// Create a new ChatServer with the given event receiver
    pub fn new(receiver: mpsc::Receiver<ChatEvent>, max_clients: Option<usize>) -> Self {
        Self {
            registry: Registry::new(),
            max_clients,
            draining: false,
            receiver,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes events until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }

        info!("ChatServer stopped");
    }

    /// Process a single event
    fn handle_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Join { client, reply } => {
                self.handle_join(client, reply);
            }
            ChatEvent::Leave { client_id } => {
                self.handle_leave(client_id);
            }
            ChatEvent::Message {
                name,
                text,
                sent_at,
            } => {
                self.handle_message(&name, &text, &sent_at);
            }
            ChatEvent::ListClients { reply } => {
                let _ = reply.send(self.registry.names());
            }
            ChatEvent::Drain { reply } => {
                let notified = self.handle_drain();
                let _ = reply.send(notified);
            }
        }
    }

    /// Handle a join request
    fn handle_join(&mut self, client: Client, reply: oneshot::Sender<JoinOutcome>) {
        if self.draining {
            debug!("Rejecting join from {} - shutting down", client.peer_addr);
            let _ = reply.send(JoinOutcome::ShuttingDown);
            return;
        }

        if let Some(limit) = self.max_clients {
            if self.registry.len() >= limit {
                warn!(
                    "Rejecting join from {} - server full ({} clients)",
                    client.peer_addr, limit
                );
                let _ = reply.send(JoinOutcome::Full);
                return;
            }
        }

        let client_id = client.id;
        let name = client.name.clone();
        let peer_addr = client.peer_addr.clone();
        if !self.registry.insert(client) {
            warn!("Rejecting join from {} - id {} already registered", peer_addr, client_id);
            let _ = reply.send(JoinOutcome::DuplicateId);
            return;
        }

        // Handler vanished while waiting; it will never send a Leave
        if reply.send(JoinOutcome::Accepted).is_err() {
            self.registry.remove(client_id);
            debug!("Join from {} abandoned", peer_addr);
            return;
        }

        info!("Client '{}' ({}) joined", name, peer_addr);
        let announcement = message::joined(&name);
        self.registry.broadcast(&announcement, Some(client_id));
        info!("{}", announcement);
        debug!("Total clients: {}", self.registry.len());
    }

    /// Handle client departure
    fn handle_leave(&mut self, client_id: ClientId) {
        if self.draining {
            debug!("Ignoring leave from {} during drain", client_id);
            return;
        }

        let Some(client) = self.registry.remove(client_id) else {
            return;
        };

        let announcement = message::left(&client.name);
        self.registry.broadcast(&announcement, None);
        info!("{}", announcement);
        debug!("Total clients: {}", self.registry.len());
    }

    /// Handle chat message
    ///
    /// Goes to every registered client, sender included.
    fn handle_message(&mut self, name: &str, text: &str, sent_at: &DateTime<Local>) {
        let line = message::chat_line(name, text, sent_at);
        self.registry.broadcast(&line, None);
        info!("{}", line);
    }

    /// Notify and close every registered client
    ///
    /// Returns how many clients were notified. Only the first call does
    /// anything.
    fn handle_drain(&mut self) -> usize {
        if self.draining {
            return 0;
        }
        self.draining = true;

        let clients = self.registry.drain();
        for client in &clients {
            if let Err(e) = client
                .send_line(message::SHUTDOWN_NOTICE)
                .and_then(|()| client.close())
            {
                debug!("Could not notify {} during drain: {}", client.name, e);
            }
        }

        info!("Drained {} clients", clients.len());
        clients.len()
    }
}
