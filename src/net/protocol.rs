//! Node context and the public operations collaborators call
//!
//! `Network` is a cheap handle over shared state. Background work is split
//! across `impl Network` blocks by concern: `connection` (dial, accept, peer
//! tasks), `discovery` (UDP announce/response), `router` (dispatcher) and
//! `transfer` (file offers and chunk streaming).

use super::access::AccessControl;
use super::codec::CodecError;
use super::history::{ChatHistory, ChatMessage};
use super::message::Envelope;
use super::peer::{PeerInfo, PeerTable};
use super::router::Inbound;
use super::transfer::{TransferRecord, TransferStatus, TransferTable};
use super::types::*;
use crate::crypto::{self, CryptoError, SharedSecret};
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("handshake timeout from {0}")]
    HandshakeTimeout(SocketAddr),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("peer {0} has no session key yet")]
    NoSessionKey(String),
    #[error("connection to {0} is closed")]
    PeerGone(String),
    #[error("transfer not found: {0}")]
    TransferNotFound(String),
    #[error("transfer {file_id} is {status}, not {expected}")]
    InvalidTransferState {
        file_id: String,
        status: TransferStatus,
        expected: TransferStatus,
    },
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("message is empty")]
    EmptyMessage,
    #[error("node is not running")]
    NotRunning,
    #[error("node is already running")]
    AlreadyRunning,
}

/// Network event for collaborators (UI, CLI)
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// Session established and keyed
    PeerConnected(PeerInfo),
    PeerDisconnected { id: String, name: String },
    PeerRenamed { id: String, old: String, new: String },
    ChatReceived(ChatMessage),
    /// Incoming offer waiting for `respond_to_file_transfer`
    FileOffered(TransferRecord),
    TransferFinished { file_id: String, status: TransferStatus },
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub display_name: String,
    pub listen_port: u16,
    pub discovery_port: u16,
    /// Auto-detected when unset
    pub local_ip: Option<IpAddr>,
    pub broadcast_ip: IpAddr,
    pub download_dir: PathBuf,
    pub discovery_enabled: bool,
    pub announce_delay: Duration,
    pub announce_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub event_queue: usize,
    pub history_capacity: usize,
    pub chunk_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            local_ip: None,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            download_dir: PathBuf::from("downloads"),
            discovery_enabled: true,
            announce_delay: ANNOUNCE_DELAY,
            announce_interval: ANNOUNCE_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            inbound_queue: INBOUND_QUEUE_CAPACITY,
            outbound_queue: OUTBOUND_QUEUE_CAPACITY,
            event_queue: EVENT_QUEUE_CAPACITY,
            history_capacity: HISTORY_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Shared node state behind every `Network` handle
pub(crate) struct Inner {
    pub(crate) config: NetConfig,
    pub(crate) identity: NodeIdentity,
    pub(crate) peers: PeerTable,
    pub(crate) history: ChatHistory,
    pub(crate) transfers: TransferTable,
    pub(crate) acl: AccessControl,
    /// Taken at shutdown; tasks hold clones only while they run
    pub(crate) discovery: Mutex<Option<Arc<UdpSocket>>>,
    pub(crate) shutdown: CancellationToken,
    /// Dropped at shutdown so the dispatcher queue closes with the last reader
    pub(crate) inbound_tx: Mutex<Option<mpsc::Sender<Inbound>>>,
    event_tx: mpsc::Sender<NetEvent>,
    running: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Accept loop and discovery tasks, joined at shutdown
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Peer overlay node
#[derive(Clone)]
pub struct Network {
    pub(crate) inner: Arc<Inner>,
}

impl Network {
    /// Bind the TCP listener and the UDP discovery socket.
    ///
    /// Port 0 picks an ephemeral port; the node ID uses the bound port.
    pub async fn bind(config: NetConfig) -> Result<(Self, mpsc::Receiver<NetEvent>), NetError> {
        let display_name = validate_name(&config.display_name)?;
        let local_ip = config.local_ip.unwrap_or_else(detect_local_ip);

        let listen_addr = SocketAddr::new(unspecified_like(local_ip), config.listen_port);
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| NetError::Bind { addr: listen_addr, source })?;
        let listen_port = listener.local_addr()?.port();

        let discovery_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.discovery_port);
        let discovery = UdpSocket::bind(discovery_addr)
            .await
            .map_err(|source| NetError::Bind { addr: discovery_addr, source })?;
        discovery.set_broadcast(true)?;
        let discovery_port = discovery.local_addr()?.port();

        let identity = NodeIdentity::new(local_ip, listen_port, discovery_port, display_name);
        info!(
            "Node {} ({}) listening on TCP {}, discovery on UDP {}",
            identity.node_id,
            config.display_name,
            identity.listen_addr(),
            discovery_port
        );

        let (event_tx, event_rx) = mpsc::channel(config.event_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));

        let inner = Inner {
            peers: PeerTable::new(),
            history: ChatHistory::new(config.history_capacity),
            transfers: TransferTable::new(),
            acl: AccessControl::new(identity.listen_addr()),
            discovery: Mutex::new(Some(Arc::new(discovery))),
            shutdown: CancellationToken::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            event_tx,
            running: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            identity,
            config,
        };

        Ok((Self { inner: Arc::new(inner) }, event_rx))
    }

    /// Spawn the accept loop, the dispatcher and (if enabled) discovery
    pub async fn start(&self) -> Result<(), NetError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(NetError::NotRunning);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }

        let listener = self.inner.listener.lock().await.take().ok_or(NetError::AlreadyRunning)?;
        let inbound_rx = self.inner.inbound_rx.lock().await.take().ok_or(NetError::AlreadyRunning)?;

        let net = self.clone();
        let accept = tokio::spawn(async move {
            net.accept_connections(listener).await;
        });
        self.inner.background.lock().await.push(accept);

        let net = self.clone();
        let dispatcher = tokio::spawn(async move {
            net.run_dispatcher(inbound_rx).await;
        });
        *self.inner.dispatcher.lock().await = Some(dispatcher);

        if self.inner.config.discovery_enabled {
            let socket = self.inner.discovery.lock().await.clone().ok_or(NetError::NotRunning)?;
            let tasks = self.start_discovery(socket);
            self.inner.background.lock().await.extend(tasks);
        } else {
            debug!("Discovery disabled");
        }

        info!("Node {} started", self.inner.identity.node_id);
        Ok(())
    }

    /// Stop all tasks, release both sockets and wait for the dispatcher to drain
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        // Readers hold the remaining senders; the queue closes when they exit
        self.inner.inbound_tx.lock().await.take();

        // Never started: the sockets are still parked here
        self.inner.listener.lock().await.take();
        self.inner.discovery.lock().await.take();

        let background: Vec<JoinHandle<()>> = self.inner.background.lock().await.drain(..).collect();
        for handle in background {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Background task did not stop within {:?}", SHUTDOWN_DRAIN_TIMEOUT);
            }
        }

        let dispatcher = self.inner.dispatcher.lock().await.take();
        if let Some(handle) = dispatcher {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Dispatcher did not drain within {:?}", SHUTDOWN_DRAIN_TIMEOUT);
            }
        }
        info!("Node {} stopped", self.inner.identity.node_id);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.inner.identity.node_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.identity.listen_addr()
    }

    pub fn discovery_port(&self) -> u16 {
        self.inner.identity.discovery_port
    }

    pub async fn display_name(&self) -> String {
        self.inner.identity.display_name().await
    }

    pub fn config(&self) -> &NetConfig {
        &self.inner.config
    }

    // =========================================================================
    // CHAT
    // =========================================================================

    /// Seal and send to every keyed peer. Peers without a session key are skipped.
    pub async fn send_public_message(&self, text: &str) -> Result<(), NetError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(NetError::EmptyMessage);
        }
        let from = self.id().to_string();

        for (peer_id, tx, secret) in self.inner.peers.senders().await {
            let Some(key) = secret else {
                debug!("No session key for {}, chat not sent", peer_id);
                continue;
            };
            let envelope = seal_chat(&from, BROADCAST_RECIPIENT, text, &key)?;
            if tx.send(envelope.into()).await.is_err() {
                debug!("Outbound queue closed for {}", peer_id);
            }
        }

        self.inner
            .history
            .push(ChatMessage {
                sender: self.display_name().await,
                recipient: BROADCAST_RECIPIENT.to_string(),
                content: text.to_string(),
                timestamp: Utc::now(),
                is_own: true,
                is_private: false,
            })
            .await;
        Ok(())
    }

    pub async fn send_private_message(&self, target_name: &str, text: &str) -> Result<(), NetError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(NetError::EmptyMessage);
        }
        let target = self
            .inner
            .peers
            .find_by_name(target_name)
            .await
            .ok_or_else(|| NetError::PeerNotFound(target_name.to_string()))?;

        let key = self
            .inner
            .peers
            .with_peer(&target.id, |p| p.shared_secret)
            .await
            .flatten()
            .ok_or_else(|| NetError::NoSessionKey(target.name.clone()))?;

        let envelope = seal_chat(self.id(), &target.id, text, &key)?;
        self.send_envelope(&target.id, envelope).await?;

        self.inner
            .history
            .push(ChatMessage {
                sender: self.display_name().await,
                recipient: target.name,
                content: text.to_string(),
                timestamp: Utc::now(),
                is_own: true,
                is_private: true,
            })
            .await;
        Ok(())
    }

    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        self.inner.history.snapshot().await
    }

    // =========================================================================
    // IDENTITY AND PEERS
    // =========================================================================

    /// Change the display name and tell every connected peer
    pub async fn rename_self(&self, new_name: &str) -> Result<(), NetError> {
        let name = validate_name(new_name)?;
        let old = self.inner.identity.set_display_name(name.clone()).await;
        if old == name {
            return Ok(());
        }
        info!("Renamed {} -> {}", old, name);

        let envelope = Envelope::update_name(self.id(), &name);
        for (peer_id, tx, _) in self.inner.peers.senders().await {
            if tx.send(envelope.clone().into()).await.is_err() {
                debug!("Outbound queue closed for {}", peer_id);
            }
        }
        Ok(())
    }

    pub async fn list_active_peers(&self) -> Vec<PeerInfo> {
        let mut peers = self.inner.peers.snapshot_active().await;
        for peer in &mut peers {
            peer.blocked = self.inner.acl.is_blocked(&peer.addr).await;
        }
        peers
    }

    pub async fn set_blocked(&self, peer_addr: SocketAddr, blocked: bool) {
        self.inner.acl.set_blocked(peer_addr, blocked).await;
    }

    pub async fn blocked_peers(&self) -> Vec<SocketAddr> {
        self.inner.acl.blocked().await
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    /// Queue an envelope on a peer's writer. The table lock is released first.
    pub(crate) async fn send_envelope(&self, peer_id: &str, envelope: Envelope) -> Result<(), NetError> {
        let tx = self
            .inner
            .peers
            .with_peer(peer_id, |p| p.tx.clone())
            .await
            .ok_or_else(|| NetError::PeerNotFound(peer_id.to_string()))?;
        tx.send(envelope.into())
            .await
            .map_err(|_| NetError::PeerGone(peer_id.to_string()))
    }

    /// Non-blocking; a full event channel drops the event
    pub(crate) fn emit(&self, event: NetEvent) {
        if let Err(e) = self.inner.event_tx.try_send(event) {
            debug!("Event dropped: {}", e);
        }
    }
}

fn seal_chat(from: &str, to: &str, text: &str, key: &SharedSecret) -> Result<Envelope, NetError> {
    let (ciphertext, nonce) = crypto::seal(key, text.as_bytes())?;
    let mut envelope = Envelope::chat(from, to, "");
    envelope.encrypted = true;
    envelope.ciphertext = Some(ciphertext);
    envelope.nonce = Some(nonce);
    Ok(envelope)
}

fn validate_name(name: &str) -> Result<String, NetError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return Err(NetError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
