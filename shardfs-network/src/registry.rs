//! Registry of connected peers, keyed by remote address

use crate::peer::Peer;
use crate::transport::TransportHooks;
use parking_lot::RwLock;
use shardfs_core::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Live connections, safe to share between the transport's connection tasks
/// and the replication logic
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, replacing any older connection from the same address
    pub fn register(&self, peer: Arc<Peer>) -> Result<()> {
        let addr = peer.addr().to_string();
        let outbound = peer.is_outbound();

        let mut peers = self.peers.write();
        if peers.insert(addr.clone(), peer).is_some() {
            warn!(peer = %addr, "Replaced existing connection");
        }
        info!(peer = %addr, outbound, total = peers.len(), "Registered peer");
        Ok(())
    }

    /// Remove `peer`, but only if it is still the registered connection for
    /// its address
    pub fn deregister(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(peer.addr()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(peer.addr());
                debug!(peer = %peer.addr(), total = peers.len(), "Deregistered peer");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(addr).cloned()
    }

    /// Point-in-time copy of every connected peer
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Transport hooks that keep this registry in sync with live connections
    pub fn transport_hooks(self: &Arc<Self>) -> TransportHooks {
        let on_peer = self.clone();
        let on_disconnect = self.clone();
        TransportHooks {
            on_peer: Some(Arc::new(move |peer: Arc<Peer>| on_peer.register(peer))),
            on_disconnect: Some(Arc::new(move |peer: &Arc<Peer>| {
                on_disconnect.deregister(peer);
            })),
            ..Default::default()
        }
    }
}
