use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Connection;

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Live connections keyed by remote address, shared by every I/O thread.
///
/// A panic in one I/O thread must not wedge the others, so a poisoned table
/// lock is taken over as is. Every update is a single insert or remove.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `remote_addr`, creating it on first sight. The
    /// flag is true when the record was created by this call.
    pub fn get_or_register(&self, remote_addr: SocketAddr) -> (SharedConnection, bool) {
        let mut connections = self.table();
        if let Some(existing) = connections.get(&remote_addr) {
            return (Arc::clone(existing), false);
        }

        let created = Arc::new(Mutex::new(Connection::new(remote_addr)));
        connections.insert(remote_addr, Arc::clone(&created));
        (created, true)
    }

    pub fn remove(&self, remote_addr: SocketAddr) -> Option<SharedConnection> {
        self.table().remove(&remote_addr)
    }

    pub fn count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SocketAddr, SharedConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
