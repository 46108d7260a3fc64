//! Peer table: one entry per remote node ID

use super::connection::Outbound;
use super::types::PeerState;
use crate::crypto::{session_fingerprint, EphemeralKeyPair, SharedSecret};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Connected peer
pub struct Peer {
    // Identity
    pub id: String,
    pub name: String,
    pub addr: SocketAddr,

    // Connection
    /// Distinguishes this socket from any other ever opened to the same ID
    pub conn_id: u64,
    pub inbound: bool,
    pub state: PeerState,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    // Session
    /// Held by the initiator until `handshake_response` arrives
    pub keypair: Option<EphemeralKeyPair>,
    /// Set once, never replaced
    pub shared_secret: Option<SharedSecret>,

    // Tasks
    pub tx: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,
}

impl Peer {
    pub fn new(
        id: String,
        name: String,
        addr: SocketAddr,
        conn_id: u64,
        inbound: bool,
        tx: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            addr,
            conn_id,
            inbound,
            state: if inbound { PeerState::Accepted } else { PeerState::Dialing },
            connected_at: now,
            last_seen: now,
            keypair: None,
            shared_secret: None,
            tx,
            cancel,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }

    /// Install the session key. Returns false if one already exists.
    pub fn set_shared_secret(&mut self, secret: SharedSecret) -> bool {
        if self.shared_secret.is_some() {
            return false;
        }
        self.shared_secret = Some(secret);
        // The ephemeral secret is no longer needed
        self.keypair = None;
        true
    }
}

/// Owned snapshot of a peer for callers outside the table lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub state: PeerState,
    pub established: bool,
    /// Filled by `Network` from the access list
    pub blocked: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub session_fingerprint: Option<String>,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id.clone(),
            name: peer.name.clone(),
            addr: peer.addr,
            inbound: peer.inbound,
            state: peer.state,
            established: peer.is_established(),
            blocked: false,
            connected_at: peer.connected_at,
            last_seen: peer.last_seen,
            session_fingerprint: peer.shared_secret.as_ref().map(session_fingerprint),
        }
    }
}

/// Registry of live sessions plus the set of dials in flight
pub struct PeerTable {
    peers: RwLock<HashMap<String, Peer>>,
    connecting: Mutex<HashSet<String>>,
    next_conn_id: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a new peer. Fails (returns false) if the ID is already present.
    #[must_use]
    pub async fn register(&self, peer: Peer) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer.id) {
            return false;
        }
        peers.insert(peer.id.clone(), peer);
        true
    }

    /// Remove `id` only if it is still owned by connection `conn_id`
    pub async fn remove_connection(&self, id: &str, conn_id: u64) -> Option<Peer> {
        let mut peers = self.peers.write().await;
        match peers.get(id) {
            Some(peer) if peer.conn_id == conn_id => peers.remove(id),
            _ => None,
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn lookup(&self, id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(id).map(PeerInfo::from)
    }

    /// All live peers, ordered by name then ID
    pub async fn snapshot_active(&self) -> Vec<PeerInfo> {
        let mut list: Vec<PeerInfo> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.state != PeerState::Closed)
            .map(PeerInfo::from)
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// First peer (by ID order) with this display name
    pub async fn find_by_name(&self, name: &str) -> Option<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.name == name)
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(PeerInfo::from)
    }

    /// Run `f` against a peer under the read lock. Never do I/O inside `f`.
    pub async fn with_peer<R>(&self, id: &str, f: impl FnOnce(&Peer) -> R) -> Option<R> {
        self.peers.read().await.get(id).map(f)
    }

    /// Run `f` against a peer under the write lock. Never do I/O inside `f`.
    pub async fn with_peer_mut<R>(&self, id: &str, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.peers.write().await.get_mut(id).map(f)
    }

    /// Outbound queues of all peers, for fan-out outside the lock
    pub async fn senders(&self) -> Vec<(String, mpsc::Sender<Outbound>, Option<SharedSecret>)> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| (p.id.clone(), p.tx.clone(), p.shared_secret))
            .collect()
    }

    pub async fn touch(&self, id: &str, conn_id: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            if peer.conn_id == conn_id {
                peer.last_seen = Utc::now();
            }
        }
    }

    // ===== In-flight dials =====

    /// Mark a dial to `id` as started. Returns false if one is already running.
    pub async fn start_connecting(&self, id: &str) -> bool {
        self.connecting.lock().await.insert(id.to_string())
    }

    pub async fn finish_connecting(&self, id: &str) {
        self.connecting.lock().await.remove(id);
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
