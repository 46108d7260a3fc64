//! Connection lifecycle: outbound dial, inbound accept, per-peer tasks
//!
//! Each session runs two tasks. The reader decodes envelopes and pushes them
//! to the dispatcher queue; it is the only code that removes a peer from the
//! table. The writer drains the peer's bounded outbound queue into the socket
//! and answers `Outbound::Flush` markers once everything before them is written.

use super::codec::JsonCodec;
use super::message::{Envelope, Payload};
use super::peer::{Peer, PeerInfo};
use super::protocol::{NetError, NetEvent, Network};
use super::router::Inbound;
use super::transfer::TransferStatus;
use super::types::PeerState;
use crate::crypto::{pubkey_fingerprint, session_fingerprint, EphemeralKeyPair};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type EnvelopeReader = FramedRead<OwnedReadHalf, JsonCodec<Envelope>>;
pub(crate) type EnvelopeWriter = FramedWrite<OwnedWriteHalf, JsonCodec<Envelope>>;

/// Pause after a failed `accept` (e.g. fd exhaustion) before retrying
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Item on a peer's outbound queue
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    /// Answered once every envelope queued before it is on the socket
    Flush(oneshot::Sender<()>),
}

impl From<Envelope> for Outbound {
    fn from(envelope: Envelope) -> Self {
        Outbound::Envelope(envelope)
    }
}

fn framed(stream: TcpStream) -> (EnvelopeReader, EnvelopeWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, JsonCodec::new()),
        FramedWrite::new(write_half, JsonCodec::new()),
    )
}

impl Network {
    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Dial a discovered peer and start the handshake.
    ///
    /// No-op if the ID is ours, already registered, or being dialed.
    /// Failures are logged and not retried.
    pub async fn connect_to_peer(&self, addr: SocketAddr, peer_id: &str, name: &str) {
        let peers = &self.inner.peers;
        if peer_id == self.id() {
            debug!("Not connecting to self");
            return;
        }
        if peers.contains(peer_id).await {
            debug!("Already connected to {}", peer_id);
            return;
        }
        if !peers.start_connecting(peer_id).await {
            debug!("Dial to {} already in flight", peer_id);
            return;
        }

        let result = self.dial(addr, peer_id, name).await;
        peers.finish_connecting(peer_id).await;

        if let Err(e) = result {
            warn!("Failed to connect to {} at {}: {}", name, addr, e);
        }
    }

    async fn dial(&self, addr: SocketAddr, peer_id: &str, name: &str) -> Result<(), NetError> {
        let stream = timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::ConnectTimeout(addr))??;
        let (reader, writer) = framed(stream);

        let keypair = EphemeralKeyPair::generate();
        let public = keypair.public;
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_queue.max(1));
        let cancel = self.inner.shutdown.child_token();
        let conn_id = self.inner.peers.next_conn_id();

        let mut peer = Peer::new(
            peer_id.to_string(),
            name.to_string(),
            addr,
            conn_id,
            false,
            tx.clone(),
            cancel.clone(),
        );
        peer.keypair = Some(keypair);
        peer.state = PeerState::HandshakeSent;

        // Registered before the handshake so a racing discovery event is a no-op
        if !self.inner.peers.register(peer).await {
            debug!("{} registered while dialing, dropping outbound socket", peer_id);
            return Ok(());
        }

        let my_name = self.display_name().await;
        tx.send(Envelope::handshake(self.id(), &my_name, &public).into())
            .await
            .map_err(|_| NetError::PeerGone(peer_id.to_string()))?;

        self.spawn_peer_tasks(peer_id.to_string(), conn_id, reader, writer, rx, cancel)
            .await;

        info!(
            "Connected to {} ({}) at {}, sent pubkey {}",
            name,
            peer_id,
            addr,
            pubkey_fingerprint(&public)
        );
        Ok(())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    pub(crate) async fn accept_connections(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming connection from {}", addr);
                    let net = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = net.handle_incoming_connection(stream, addr).await {
                            debug!("Rejected connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        debug!("Accept loop stopped");
    }

    /// The first envelope must be a `handshake` from an unregistered peer.
    /// Anything else closes the socket with no state kept.
    pub(crate) async fn handle_incoming_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), NetError> {
        let (mut reader, writer) = framed(stream);

        let first = match timeout(self.inner.config.handshake_timeout, reader.next()).await {
            Err(_) => return Err(NetError::HandshakeTimeout(addr)),
            Ok(None) => return Err(NetError::Protocol("closed before handshake".into())),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(envelope))) => envelope,
        };

        let (name, remote_public) = match first.payload() {
            Ok(Payload::Handshake { name, public_key }) => (name, public_key),
            Ok(_) => {
                return Err(NetError::Protocol(format!(
                    "expected handshake, got {}",
                    first.kind.command()
                )))
            }
            Err(e) => return Err(NetError::Protocol(e.to_string())),
        };

        let peer_id = first.from;
        if peer_id.is_empty() || peer_id == self.id() {
            return Err(NetError::Protocol("handshake from self".into()));
        }
        if self.inner.peers.contains(&peer_id).await {
            return Err(NetError::Protocol(format!("{} is already connected", peer_id)));
        }

        let keypair = EphemeralKeyPair::generate();
        let secret = keypair.derive(&remote_public)?;

        let (tx, rx) = mpsc::channel(self.inner.config.outbound_queue.max(1));
        let cancel = self.inner.shutdown.child_token();
        let conn_id = self.inner.peers.next_conn_id();
        let name = if name.trim().is_empty() { peer_id.clone() } else { name };

        let mut peer = Peer::new(peer_id.clone(), name, addr, conn_id, true, tx.clone(), cancel.clone());
        peer.set_shared_secret(secret);
        peer.state = PeerState::KeyDerived;

        if !self.inner.peers.register(peer).await {
            return Err(NetError::Protocol(format!("{} is already connected", peer_id)));
        }

        let my_name = self.display_name().await;
        tx.send(Envelope::handshake_response(self.id(), &peer_id, &my_name, &keypair.public).into())
            .await
            .map_err(|_| NetError::PeerGone(peer_id.clone()))?;

        let info = self
            .inner
            .peers
            .with_peer_mut(&peer_id, |p| {
                p.state = PeerState::Established;
                PeerInfo::from(&*p)
            })
            .await;

        self.spawn_peer_tasks(peer_id.clone(), conn_id, reader, writer, rx, cancel)
            .await;

        info!(
            "Peer connected: {} ({}) from {}, session {}",
            peer_id,
            info.as_ref().map(|i| i.name.as_str()).unwrap_or_default(),
            addr,
            session_fingerprint(&secret)
        );
        if let Some(info) = info {
            self.emit(NetEvent::PeerConnected(info));
        }
        Ok(())
    }

    // =========================================================================
    // PER-PEER TASKS
    // =========================================================================

    async fn spawn_peer_tasks(
        &self,
        peer_id: String,
        conn_id: u64,
        reader: EnvelopeReader,
        writer: EnvelopeWriter,
        rx: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(write_loop(peer_id.clone(), writer, rx, cancel.clone()));

        let inbound = self.inner.inbound_tx.lock().await.clone();
        let Some(inbound) = inbound else {
            // Shutting down: the dispatcher no longer takes input
            cancel.cancel();
            self.inner.peers.remove_connection(&peer_id, conn_id).await;
            return;
        };

        let net = self.clone();
        tokio::spawn(async move {
            net.handle_peer_connection(peer_id, conn_id, reader, inbound, cancel)
                .await;
        });
    }

    /// Reader task. Removes its own peer entry on exit.
    async fn handle_peer_connection(
        self,
        peer_id: String,
        conn_id: u64,
        mut reader: EnvelopeReader,
        inbound: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };

            match next {
                Some(Ok(envelope)) => {
                    self.inner.peers.touch(&peer_id, conn_id).await;
                    let msg = Inbound {
                        peer_id: peer_id.clone(),
                        conn_id,
                        envelope,
                    };
                    let queued = tokio::select! {
                        _ = cancel.cancelled() => break,
                        queued = inbound.send(msg) => queued,
                    };
                    if queued.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("Read error from {}: {}", peer_id, e);
                    break;
                }
                None => {
                    debug!("{} closed the connection", peer_id);
                    break;
                }
            }
        }

        cancel.cancel();
        drop(inbound);

        if let Some(mut peer) = self.inner.peers.remove_connection(&peer_id, conn_id).await {
            peer.state = PeerState::Closed;
            info!("Peer disconnected: {} ({})", peer.name, peer.id);
            for file_id in self.inner.transfers.fail_peer(&peer.id).await {
                self.emit(NetEvent::TransferFinished {
                    file_id,
                    status: TransferStatus::Failed,
                });
            }
            self.emit(NetEvent::PeerDisconnected {
                id: peer.id,
                name: peer.name,
            });
        }
    }
}

/// Writer task. A write error cancels the connection so the reader tears it down.
///
/// Pending `Flush` acks are dropped on exit, so waiters see the failure.
async fn write_loop(
    peer_id: String,
    mut writer: EnvelopeWriter,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        let envelope = match next {
            Some(Outbound::Envelope(envelope)) => envelope,
            Some(Outbound::Flush(ack)) => {
                // `send` flushes per envelope, so everything before is written
                let _ = ack.send(());
                continue;
            }
            None => break,
        };

        if let Err(e) = writer.send(envelope).await {
            debug!("Write error to {}: {}", peer_id, e);
            cancel.cancel();
            break;
        }
    }
    let _ = writer.close().await;
}
