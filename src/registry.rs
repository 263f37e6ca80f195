//! Registry of live connections.
//!
//! The only state shared by every connection. Its length is the live
//! connection count the accept loop checks against `max_conn`.

use crate::connection::Connection;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection id to connection, behind one reader/writer lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u32, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id();
        let count = {
            let mut connections = self.connections.write();
            connections.insert(conn_id, conn);
            connections.len()
        };
        debug!(conn_id, count, "Connection registered");
    }

    /// Remove a connection without stopping it.
    pub fn remove(&self, conn_id: u32) -> Option<Arc<Connection>> {
        let (removed, count) = {
            let mut connections = self.connections.write();
            (connections.remove(&conn_id), connections.len())
        };
        if removed.is_some() {
            debug!(conn_id, count, "Connection removed");
        }
        removed
    }

    pub fn get(&self, conn_id: u32) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .get(&conn_id)
            .cloned()
            .ok_or(Error::ConnectionNotFound(conn_id))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and remove every connection.
    pub fn clear_conn(&self) {
        let mut connections = self.connections.write();
        let cleared = connections.len();
        for (_, conn) in connections.drain() {
            conn.stop();
        }
        info!(cleared, "Cleared all connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataPack;
    use crate::connection::tests::{loopback, test_config};
    use crate::connection::ConnState;
    use crate::server::ServerCore;

    #[tokio::test]
    async fn test_add_get_remove() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let registry = ConnectionRegistry::new();

        // loopback() registers with the core's registry; reuse those
        // connections against a standalone registry here.
        let (c1, _k1) = loopback(&core, 1).await;
        let (c2, _k2) = loopback(&core, 2).await;

        registry.add(Arc::clone(&c1));
        registry.add(Arc::clone(&c2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(2).unwrap().conn_id(), 2);

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get(1), Err(Error::ConnectionNotFound(1))));
    }

    #[tokio::test]
    async fn test_clear_conn_stops_everything() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (c1, _k1) = loopback(&core, 1).await;
        let (c2, _k2) = loopback(&core, 2).await;
        let t1 = c1.cancellation_token();
        let t2 = c2.cancellation_token();

        core.registry().clear_conn();

        assert!(core.registry().is_empty());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert_eq!(c1.state(), ConnState::Created);
    }
}
