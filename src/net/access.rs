//! Per-node block list
//!
//! Entries are keyed by the owning node's listen address, then by the peer's
//! session address as shown in [`PeerInfo::addr`](super::peer::PeerInfo).
//! Blocking drops a peer's chat on receive; the session itself stays up.

use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use tracing::info;

/// Two-level access map: owner -> peer -> allowed
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    acls: HashMap<SocketAddr, HashMap<SocketAddr, bool>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self { acls: HashMap::new() }
    }

    pub fn set_allowed(&mut self, owner: SocketAddr, peer: SocketAddr, allowed: bool) {
        self.acls.entry(owner).or_default().insert(peer, allowed);
    }

    /// Peers with no entry are allowed
    pub fn is_allowed(&self, owner: &SocketAddr, peer: &SocketAddr) -> bool {
        self.acls
            .get(owner)
            .and_then(|m| m.get(peer))
            .copied()
            .unwrap_or(true)
    }

    pub fn blocked(&self, owner: &SocketAddr) -> Vec<SocketAddr> {
        let mut list: Vec<SocketAddr> = self
            .acls
            .get(owner)
            .map(|m| m.iter().filter(|(_, allowed)| !**allowed).map(|(a, _)| *a).collect())
            .unwrap_or_default();
        list.sort();
        list
    }
}

/// Block list for one local node
pub struct AccessControl {
    owner: SocketAddr,
    list: RwLock<AccessList>,
}

impl AccessControl {
    pub fn new(owner: SocketAddr) -> Self {
        Self {
            owner,
            list: RwLock::new(AccessList::new()),
        }
    }

    pub async fn is_blocked(&self, peer: &SocketAddr) -> bool {
        !self.list.read().await.is_allowed(&self.owner, peer)
    }

    pub async fn set_blocked(&self, peer: SocketAddr, blocked: bool) {
        if blocked {
            info!("Blocking {}", peer);
        } else {
            info!("Unblocking {}", peer);
        }
        self.list.write().await.set_allowed(self.owner, peer, !blocked);
    }

    pub async fn blocked(&self) -> Vec<SocketAddr> {
        self.list.read().await.blocked(&self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_unblock() {
        let acl = AccessControl::new("10.0.0.1:8888".parse().unwrap());
        let peer: SocketAddr = "10.0.0.2:8888".parse().unwrap();

        assert!(!acl.is_blocked(&peer).await);
        acl.set_blocked(peer, true).await;
        assert!(acl.is_blocked(&peer).await);
        assert_eq!(acl.blocked().await, vec![peer]);

        acl.set_blocked(peer, false).await;
        assert!(!acl.is_blocked(&peer).await);
        assert!(acl.blocked().await.is_empty());
    }

    #[test]
    fn test_lists_are_per_owner() {
        let mut list = AccessList::new();
        let a: SocketAddr = "10.0.0.1:8888".parse().unwrap();
        let b: SocketAddr = "10.0.0.3:8888".parse().unwrap();
        let peer: SocketAddr = "10.0.0.2:8888".parse().unwrap();

        list.set_allowed(a, peer, false);
        assert!(!list.is_allowed(&a, &peer));
        assert!(list.is_allowed(&b, &peer));
    }
}
