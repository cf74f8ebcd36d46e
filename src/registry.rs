//! Client registry
//!
//! The authoritative set of joined clients. Owned by the coordinator and
//! mutated only from its event loop, so it carries no locking of its own.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::client::Client;
use crate::message::Outbound;
use crate::types::ClientId;

/// Registry of joined clients
///
/// Clients are stored by join sequence number, so iteration is join order
/// with no sorting. A second map resolves a `ClientId` to its sequence
/// number. Two listings with no join or leave in between are identical.
#[derive(Debug, Default)]
pub struct Registry {
    clients: BTreeMap<u64, Client>,
    index: HashMap<ClientId, u64>,
    next_seq: u64,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client
    ///
    /// Returns false (and leaves the registry unchanged) if the id is
    /// already present.
    pub fn insert(&mut self, client: Client) -> bool {
        if self.index.contains_key(&client.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(client.id, seq);
        self.clients.insert(seq, client);
        true
    }

    /// Deregister a client, returning it if it was present
    pub fn remove(&mut self, client_id: ClientId) -> Option<Client> {
        let seq = self.index.remove(&client_id)?;
        self.clients.remove(&seq)
    }

    /// Check if a client is registered
    pub fn contains(&self, client_id: ClientId) -> bool {
        self.index.contains_key(&client_id)
    }

    /// Look up a registered client
    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.index
            .get(&client_id)
            .and_then(|seq| self.clients.get(seq))
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if no client is registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Display names in join order
    pub fn names(&self) -> Vec<String> {
        self.clients.values().map(|client| client.name.clone()).collect()
    }

    /// Queue a line for every registered client except `exclude`
    ///
    /// A client whose writer is gone is skipped and logged; delivery to the
    /// rest continues. Returns how many clients the line was queued for.
    pub fn broadcast(&self, line: &str, exclude: Option<ClientId>) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            if Some(client.id) == exclude {
                continue;
            }
            match client.send(Outbound::line(line)) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Delivery to {} ({}) failed: {}", client.name, client.id, e),
            }
        }
        delivered
    }

    /// Remove every client, returning them in join order
    pub fn drain(&mut self) -> Vec<Client> {
        self.index.clear();
        std::mem::take(&mut self.clients).into_values().collect()
    }
}
