// LANShare Network Layer: Constants and Types

//! Network constants, node identity and the per-connection state machine.
//!
//! # Threat model
//!
//! A single LAN broadcast domain. Discovery is unauthenticated; a spoofed
//! announce can only cause an extra outbound dial. Chat content is
//! confidential per session (X25519 + AES-256-GCM); control envelopes
//! (`file_*`, `update_name`) travel in clear.

use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::sync::RwLock;

// =============================================================================
// PORTS
// =============================================================================

/// Default TCP port for peer sessions
pub const DEFAULT_LISTEN_PORT: u16 = 8888;

/// Default UDP port for discovery announce/response
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;

// =============================================================================
// TIMING
// =============================================================================

/// Delay between binding the discovery socket and the first announce
pub const ANNOUNCE_DELAY: Duration = Duration::from_secs(1);

/// Re-announce period
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound TCP dial timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time an accepted socket has to deliver its `handshake` envelope
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `shutdown()` waits for the dispatcher to drain
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// LIMITS
// =============================================================================

/// Bounded inbound queue between peer readers and the dispatcher
pub const INBOUND_QUEUE_CAPACITY: usize = 100;

/// Per-peer outbound queue (writer task backpressure)
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Collaborator event channel; full channel drops events
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Chat history ring size (oldest evicted first)
pub const HISTORY_CAPACITY: usize = 100;

/// File bytes per `file_chunk` envelope
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Largest single envelope accepted from the stream.
/// A 32 KiB chunk is ~44 KiB once base64'd; 4 MiB leaves room for
/// peers configured with larger chunks.
pub const MAX_ENVELOPE_SIZE: usize = 4 * 1024 * 1024;

/// Largest discovery datagram we read
pub const MAX_DISCOVERY_PACKET: usize = 1024;

/// Recipient value for public chat
pub const BROADCAST_RECIPIENT: &str = "all";

// =============================================================================
// NODE IDENTITY
// =============================================================================

/// This node's identity, alive for the process lifetime.
///
/// `node_id` is immutable; `display_name` can change via `rename_self`.
#[derive(Debug)]
pub struct NodeIdentity {
    pub node_id: String,
    pub local_ip: IpAddr,
    pub listen_port: u16,
    pub discovery_port: u16,
    display_name: RwLock<String>,
}

impl NodeIdentity {
    pub fn new(local_ip: IpAddr, listen_port: u16, discovery_port: u16, name: String) -> Self {
        let started_at = Utc::now();
        Self {
            node_id: derive_node_id(local_ip, listen_port, &started_at),
            local_ip,
            listen_port,
            discovery_port,
            display_name: RwLock::new(name),
        }
    }

    pub async fn display_name(&self) -> String {
        self.display_name.read().await.clone()
    }

    /// Returns the previous name
    pub async fn set_display_name(&self, name: String) -> String {
        std::mem::replace(&mut *self.display_name.write().await, name)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.listen_port)
    }
}

/// `{ip}_{port}_{unix_millis}`: unique per host+port+start instant
pub fn derive_node_id(ip: IpAddr, port: u16, started_at: &DateTime<Utc>) -> String {
    format!("{}_{}_{}", ip, port, started_at.timestamp_millis())
}

/// Pick the LAN address the OS would route through.
///
/// Connecting a UDP socket sends nothing; it only resolves the route.
/// Falls back to loopback on hosts with no default route.
pub fn detect_local_ip() -> IpAddr {
    let route = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match route() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

// =============================================================================
// CONNECTION STATE MACHINE
// =============================================================================

/// Per-connection state.
///
/// ```text
/// Initiator:                         Acceptor:
///
/// ┌─────────┐                        ┌──────────┐
/// │ Dialing │                        │ Accepted │
/// └────┬────┘                        └────┬─────┘
///      │ TCP up, handshake queued         │ handshake read, key derived
///      ▼                                  ▼
/// ┌──────────────┐                   ┌────────────┐
/// │HandshakeSent │                   │ KeyDerived │
/// └────┬─────────┘                   └────┬───────┘
///      │ recv handshake_response,         │ handshake_response queued
///      │ key derived                      │
///      ▼                                  ▼
/// ┌─────────────┐                    ┌─────────────┐
/// │ Established │                    │ Established │
/// └─────────────┘                    └─────────────┘
///
/// Any state ── socket error / EOF / shutdown ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Dialing,
    HandshakeSent,
    Accepted,
    KeyDerived,
    Established,
    Closed,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Dialing => "dialing",
            PeerState::HandshakeSent => "handshake_sent",
            PeerState::Accepted => "accepted",
            PeerState::KeyDerived => "key_derived",
            PeerState::Established => "established",
            PeerState::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_includes_address_and_port() {
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let id = derive_node_id(ip, 8888, &Utc::now());
        assert!(id.starts_with("192.168.1.20_8888_"));
    }

    #[test]
    fn test_node_ids_differ_by_port() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let t = Utc::now();
        assert_ne!(derive_node_id(ip, 1000, &t), derive_node_id(ip, 1001, &t));
    }

    #[tokio::test]
    async fn test_rename_returns_previous() {
        let id = NodeIdentity::new("127.0.0.1".parse().unwrap(), 1, 2, "alice".into());
        let old = id.set_display_name("alicia".into()).await;
        assert_eq!(old, "alice");
        assert_eq!(id.display_name().await, "alicia");
    }
}
