//! The active-connection table.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::channel::FramedChannel;
use crate::types::{Identity, Role};

/// A channel shared between the connection's own session and any controller
/// relaying to it.
pub type SharedChannel = Arc<Mutex<FramedChannel<TcpStream>>>;

/// A connected, identified peer.
#[derive(Clone)]
pub struct ActiveConnection {
    /// Router-assigned, unique for the process lifetime.
    pub id: u64,
    pub identity: Identity,
    pub channel: SharedChannel,
    pub remote: SocketAddr,
}

#[derive(Default)]
pub struct ConnectionTable {
    connections: Vec<ActiveConnection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. An endpoint replaces any older connection that
    /// claimed the same uuid; the replaced entries are returned.
    pub fn insert(&mut self, connection: ActiveConnection) -> Vec<ActiveConnection> {
        let mut replaced = Vec::new();
        if connection.identity.role == Role::Endpoint {
            let uuid = connection.identity.uuid.clone();
            let (stale, kept): (Vec<_>, Vec<_>) =
                self.connections.drain(..).partition(|existing| {
                    existing.identity.role == Role::Endpoint && existing.identity.uuid == uuid
                });
            self.connections = kept;
            replaced = stale;
        }
        self.connections.push(connection);
        replaced
    }

    pub fn remove(&mut self, id: u64) -> Option<ActiveConnection> {
        let index = self.connections.iter().position(|c| c.id == id)?;
        Some(self.connections.remove(index))
    }

    /// The endpoint connection currently registered for `uuid`.
    pub fn find_endpoint(&self, uuid: &str) -> Option<ActiveConnection> {
        self.connections
            .iter()
            .find(|c| c.identity.role == Role::Endpoint && c.identity.uuid == uuid)
            .cloned()
    }

    pub fn endpoints(&self) -> Vec<Identity> {
        self.connections
            .iter()
            .filter(|c| c.identity.role == Role::Endpoint)
            .map(|c| c.identity.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn drain(&mut self) -> Vec<ActiveConnection> {
        std::mem::take(&mut self.connections)
    }
}
