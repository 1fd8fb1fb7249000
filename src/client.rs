//! Outbound connections: dialing and the live-connection pool.

use std::collections::HashMap;
use std::sync::Mutex;

use iroh::endpoint::Connection;
use iroh::{Endpoint, EndpointAddr, EndpointId};
use tracing::{debug, info};

use crate::alpn::ProtocolId;
use crate::error::{Error, Result};
use crate::id::NodeId;

/// Dial `addr` with the ALPN of `protocol`.
pub(crate) async fn dial(
    endpoint: &Endpoint,
    peer: EndpointId,
    addr: EndpointAddr,
    protocol: &ProtocolId,
) -> Result<Connection> {
    debug!(%peer, %protocol, "connecting to peer");
    let connection = endpoint
        .connect(addr, protocol.as_bytes())
        .await
        .map_err(|source| Error::Dial {
            node_id: NodeId::from(peer),
            protocol: protocol.clone(),
            source,
        })?;
    info!(%peer, %protocol, "connected to peer");
    Ok(connection)
}

/// Live connections keyed by peer and protocol.
///
/// Connections stay pooled until they close; a closed entry is evicted the
/// next time it is looked up.
#[derive(Default)]
pub(crate) struct ConnectionPool {
    connections: Mutex<HashMap<(EndpointId, ProtocolId), Connection>>,
}

impl ConnectionPool {
    /// A live pooled connection, if any.
    pub(crate) fn get(&self, peer: EndpointId, protocol: &ProtocolId) -> Option<Connection> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let key = (peer, protocol.clone());
        match connections.get(&key) {
            Some(connection) if connection.close_reason().is_none() => Some(connection.clone()),
            Some(_) => {
                connections.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Pool a connection, replacing any previous one for the same key.
    pub(crate) fn insert(&self, peer: EndpointId, protocol: ProtocolId, connection: Connection) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((peer, protocol), connection);
    }

    /// Drop the pooled entry only if it is still `connection`.
    pub(crate) fn remove_if_same(&self, peer: EndpointId, protocol: &ProtocolId, connection: &Connection) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let key = (peer, protocol.clone());
        if connections
            .get(&key)
            .is_some_and(|pooled| pooled.stable_id() == connection.stable_id())
        {
            connections.remove(&key);
        }
    }

    /// Number of pooled entries, live or not.
    pub(crate) fn len(&self) -> usize {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
