//! Dispatcher: drains the inbound queue and routes envelopes by kind

use super::history::ChatMessage;
use super::message::{ChatBody, Envelope, Payload, PayloadError};
use super::peer::PeerInfo;
use super::protocol::{NetEvent, Network};
use super::types::{PeerState, BROADCAST_RECIPIENT};
use crate::crypto::{self, session_fingerprint};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shown in place of chat that failed authentication
pub const DECRYPT_FAILED_PLACEHOLDER: &str = "[decryption failed]";

/// Shown in place of sealed chat from a peer with no session key
pub const NO_SESSION_KEY_PLACEHOLDER: &str = "[no session key]";

/// Envelope tagged with the connection it arrived on
#[derive(Debug)]
pub(crate) struct Inbound {
    pub peer_id: String,
    pub conn_id: u64,
    pub envelope: Envelope,
}

enum KeyOutcome {
    Established(PeerInfo),
    AlreadyKeyed,
    NoKeypair,
    Failed(crypto::CryptoError),
}

impl Network {
    pub(crate) async fn run_dispatcher(self, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(inbound) = rx.recv().await {
            self.dispatch(inbound).await;
        }
        debug!("Dispatcher drained");
    }

    pub(crate) async fn dispatch(&self, inbound: Inbound) {
        let Inbound {
            peer_id,
            conn_id,
            envelope,
        } = inbound;

        // Attribution comes from the connection, not from the envelope
        if envelope.from != peer_id {
            debug!(
                "Dropping {} from {}: claims to be {}",
                envelope.kind.command(),
                peer_id,
                envelope.from
            );
            return;
        }
        let owner = self.inner.peers.with_peer(&peer_id, |p| p.conn_id).await;
        if owner != Some(conn_id) {
            debug!("Dropping {} from stale connection to {}", envelope.kind.command(), peer_id);
            return;
        }

        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(PayloadError::UnknownKind) => {
                debug!("Ignoring unknown envelope kind from {}", peer_id);
                return;
            }
            Err(e) => {
                debug!("Dropping malformed {} from {}: {}", envelope.kind.command(), peer_id, e);
                return;
            }
        };

        match payload {
            Payload::Handshake { .. } => {
                debug!("Ignoring repeated handshake from {}", peer_id);
            }
            Payload::HandshakeResponse { name, public_key } => {
                self.on_handshake_response(&peer_id, name, public_key).await;
            }
            Payload::Chat(body) => self.on_chat(&peer_id, &envelope, body).await,
            Payload::FileRequest(request) => self.on_file_request(&peer_id, request).await,
            Payload::FileResponse(response) => self.on_file_response(&peer_id, response).await,
            Payload::FileChunk(chunk) => self.on_file_chunk(&peer_id, chunk).await,
            Payload::UpdateName(name) => self.on_update_name(&peer_id, name).await,
        }
    }

    async fn on_handshake_response(&self, peer_id: &str, name: String, public_key: [u8; 32]) {
        let outcome = self
            .inner
            .peers
            .with_peer_mut(peer_id, |peer| {
                if peer.shared_secret.is_some() {
                    return KeyOutcome::AlreadyKeyed;
                }
                let Some(keypair) = peer.keypair.as_ref() else {
                    return KeyOutcome::NoKeypair;
                };
                let secret = match keypair.derive(&public_key) {
                    Ok(secret) => secret,
                    Err(e) => return KeyOutcome::Failed(e),
                };
                peer.set_shared_secret(secret);
                peer.state = PeerState::Established;
                let name = name.trim();
                if !name.is_empty() {
                    peer.name = name.to_string();
                }
                KeyOutcome::Established(PeerInfo::from(&*peer))
            })
            .await;

        match outcome {
            Some(KeyOutcome::Established(info)) => {
                info!(
                    "Secure session with {} ({}) established, session {}",
                    info.name,
                    info.id,
                    info.session_fingerprint.as_deref().unwrap_or("-")
                );
                self.emit(NetEvent::PeerConnected(info));
            }
            Some(KeyOutcome::AlreadyKeyed) => {
                debug!("Ignoring handshake_response from {}: already keyed", peer_id);
            }
            Some(KeyOutcome::NoKeypair) => {
                debug!("Ignoring handshake_response from {}: not the initiator", peer_id);
            }
            Some(KeyOutcome::Failed(e)) => {
                warn!("Key agreement with {} failed: {}", peer_id, e);
            }
            None => {}
        }
    }

    async fn on_chat(&self, peer_id: &str, envelope: &Envelope, body: ChatBody) {
        let Some((addr, sender, secret)) = self
            .inner
            .peers
            .with_peer(peer_id, |p| (p.addr, p.name.clone(), p.shared_secret))
            .await
        else {
            return;
        };

        let is_private = if envelope.is_broadcast() {
            false
        } else if envelope.to == self.id() {
            true
        } else {
            debug!("Dropping chat from {} addressed to {}", peer_id, envelope.to);
            return;
        };

        if self.inner.acl.is_blocked(&addr).await {
            debug!("Dropping chat from blocked peer {}", addr);
            return;
        }

        let content = match body {
            ChatBody::Plain(text) => text,
            ChatBody::Sealed { ciphertext, nonce } => match secret {
                None => NO_SESSION_KEY_PLACEHOLDER.to_string(),
                Some(key) => match crypto::open(&key, &ciphertext, &nonce) {
                    Ok(plaintext) => String::from_utf8_lossy(&plaintext).into_owned(),
                    Err(e) => {
                        warn!(
                            "Chat from {} failed to open under session {}: {}",
                            peer_id,
                            session_fingerprint(&key),
                            e
                        );
                        DECRYPT_FAILED_PLACEHOLDER.to_string()
                    }
                },
            },
        };

        let recipient = if is_private {
            self.display_name().await
        } else {
            BROADCAST_RECIPIENT.to_string()
        };
        // Zero-valued timestamps from older clients
        let timestamp = if envelope.timestamp.timestamp() > 0 {
            envelope.timestamp
        } else {
            Utc::now()
        };

        let msg = ChatMessage {
            sender,
            recipient,
            content,
            timestamp,
            is_own: false,
            is_private,
        };
        self.inner.history.push(msg.clone()).await;
        self.emit(NetEvent::ChatReceived(msg));
    }

    async fn on_update_name(&self, peer_id: &str, name: String) {
        let name = name.trim().to_string();
        if name.is_empty() {
            return;
        }
        let old = self
            .inner
            .peers
            .with_peer_mut(peer_id, |p| std::mem::replace(&mut p.name, name.clone()))
            .await;

        if let Some(old) = old {
            if old != name {
                info!("{} is now known as {}", old, name);
                self.emit(NetEvent::PeerRenamed {
                    id: peer_id.to_string(),
                    old,
                    new: name,
                });
            }
        }
    }
}
