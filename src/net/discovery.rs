//! UDP broadcast discovery
//!
//! Every node announces itself on the broadcast address and answers
//! announces from unknown nodes with a unicast `response`. To keep one TCP
//! session per pair, only the side with the smaller node ID dials.

use super::message::{DiscoveryKind, DiscoveryPacket};
use super::protocol::Network;
use super::types::MAX_DISCOVERY_PACKET;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Floor for the re-announce period (`interval` rejects zero)
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(100);

/// What to do with a received discovery packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryAction {
    /// Own echo, known peer, or a response we leave to the other side
    Ignore,
    /// Answer the announce; the other side dials us
    Reply,
    Connect,
    ConnectAndReply,
}

impl DiscoveryAction {
    pub fn connects(&self) -> bool {
        matches!(self, DiscoveryAction::Connect | DiscoveryAction::ConnectAndReply)
    }

    pub fn replies(&self) -> bool {
        matches!(self, DiscoveryAction::Reply | DiscoveryAction::ConnectAndReply)
    }
}

/// Decide how to react to `packet`. `known` is whether its sender is in the peer table.
pub fn classify(local_id: &str, packet: &DiscoveryPacket, known: bool) -> DiscoveryAction {
    if packet.id == local_id || known {
        return DiscoveryAction::Ignore;
    }
    let dial = local_id < packet.id.as_str();
    match (packet.kind, dial) {
        (DiscoveryKind::Announce, true) => DiscoveryAction::ConnectAndReply,
        (DiscoveryKind::Announce, false) => DiscoveryAction::Reply,
        (DiscoveryKind::Response, true) => DiscoveryAction::Connect,
        (DiscoveryKind::Response, false) => DiscoveryAction::Ignore,
    }
}

impl Network {
    /// Spawn the listener and the announce loop. Both exit on shutdown.
    pub(crate) fn start_discovery(&self, socket: Arc<UdpSocket>) -> [JoinHandle<()>; 2] {
        let net = self.clone();
        let listener = tokio::spawn(async move {
            net.discovery_listener(socket).await;
        });

        let net = self.clone();
        let announcer = tokio::spawn(async move {
            net.announce_loop().await;
        });
        [listener, announcer]
    }

    async fn discovery_listener(self, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; MAX_DISCOVERY_PACKET];

        loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, src) = match received {
                Ok(r) => r,
                Err(e) => {
                    debug!("Discovery recv error: {}", e);
                    continue;
                }
            };

            let packet: DiscoveryPacket = match serde_json::from_slice(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    debug!("Malformed discovery packet from {}: {}", src, e);
                    continue;
                }
            };

            self.handle_discovery_packet(packet, src).await;
        }
        debug!("Discovery listener stopped");
    }

    async fn announce_loop(self) {
        let config = &self.inner.config;
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(config.announce_delay) => {}
        }

        let mut ticker = tokio::time::interval(config.announce_interval.max(MIN_ANNOUNCE_INTERVAL));
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => self.announce().await,
            }
        }
    }

    /// Broadcast one `announce`
    pub async fn announce(&self) {
        let target = SocketAddr::new(self.inner.config.broadcast_ip, self.discovery_port());
        let packet = self.local_packet(DiscoveryKind::Announce).await;
        match self.send_discovery(&packet, target).await {
            Ok(()) => debug!("Announced to {}", target),
            Err(e) => warn!("Announce to {} failed: {}", target, e),
        }
    }

    /// React to one discovery packet received from `src`
    pub async fn handle_discovery_packet(&self, packet: DiscoveryPacket, src: SocketAddr) -> DiscoveryAction {
        let known = self.inner.peers.contains(&packet.id).await;
        let action = classify(self.id(), &packet, known);
        if action == DiscoveryAction::Ignore {
            return action;
        }

        info!("Discovered {} ({}) via {:?} from {}", packet.name, packet.id, packet.kind, src);

        if action.replies() {
            let response = self.local_packet(DiscoveryKind::Response).await;
            if let Err(e) = self.send_discovery(&response, src).await {
                warn!("Discovery response to {} failed: {}", src, e);
            }
        }

        if action.connects() {
            // Fall back to the datagram source if the advertised IP is garbage
            let ip = packet.ip.parse::<IpAddr>().unwrap_or_else(|_| src.ip());
            let addr = SocketAddr::new(ip, packet.port);
            let net = self.clone();
            tokio::spawn(async move {
                net.connect_to_peer(addr, &packet.id, &packet.name).await;
            });
        }

        action
    }

    async fn local_packet(&self, kind: DiscoveryKind) -> DiscoveryPacket {
        let identity = &self.inner.identity;
        DiscoveryPacket {
            kind,
            id: identity.node_id.clone(),
            name: identity.display_name().await,
            ip: identity.local_ip.to_string(),
            port: identity.listen_port,
        }
    }

    async fn send_discovery(&self, packet: &DiscoveryPacket, target: SocketAddr) -> io::Result<()> {
        let socket = self
            .inner
            .discovery
            .lock()
            .await
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "discovery socket closed"))?;
        let data = serde_json::to_vec(packet)?;
        socket.send_to(&data, target).await?;
        Ok(())
    }
}
