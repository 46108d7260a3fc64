//! Network integration tests for LANShare
//!
//! Real nodes on 127.0.0.1 with ephemeral ports and discovery disabled.
//! Run with: cargo test --test net_test -- --nocapture

use lanshare::net::{
    new_file_id, DiscoveryAction, DiscoveryKind, DiscoveryPacket, NetConfig, NetError, NetEvent,
    Network, PeerState, TransferStatus,
};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

struct TestNode {
    net: Network,
    events: mpsc::Receiver<NetEvent>,
    download_dir: PathBuf,
}

impl TestNode {
    async fn spawn(name: &str) -> Self {
        Self::spawn_with(name, |_| {}).await
    }

    async fn spawn_with(name: &str, tweak: impl FnOnce(&mut NetConfig)) -> Self {
        let download_dir = std::env::temp_dir().join(format!("lanshare_test_{}_{}", name, new_file_id()));
        let mut config = NetConfig {
            display_name: name.to_string(),
            listen_port: 0,
            discovery_port: 0,
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            download_dir: download_dir.clone(),
            discovery_enabled: false,
            ..Default::default()
        };
        tweak(&mut config);

        let (net, events) = Network::bind(config).await.expect("bind");
        net.start().await.expect("start");
        Self {
            net,
            events,
            download_dir,
        }
    }

    /// Dial `other` and wait until both sides hold an established, keyed session
    async fn connect(&self, other: &TestNode) {
        let name = other.net.display_name().await;
        self.net
            .connect_to_peer(other.net.listen_addr(), other.net.id(), &name)
            .await;

        let me = self.net.id().to_string();
        let them = other.net.id().to_string();
        assert!(
            wait_for(|| async {
                established_with(&self.net, &them).await && established_with(&other.net, &me).await
            })
            .await,
            "session between {} and {} not established",
            me,
            them
        );
    }

    async fn history_contents(&self) -> Vec<String> {
        self.net.chat_history().await.into_iter().map(|m| m.content).collect()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.download_dir);
    }
}

async fn established_with(net: &Network, peer_id: &str) -> bool {
    net.list_active_peers()
        .await
        .iter()
        .any(|p| p.id == peer_id && p.established && p.session_fingerprint.is_some())
}

/// Poll `check` until it returns true or the wait limit passes
async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn temp_file(tag: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("lanshare_src_{}_{}.bin", tag, new_file_id()));
    std::fs::write(&path, contents).expect("write source file");
    path
}

// =============================================================================
// SESSIONS AND CHAT
// =============================================================================

#[tokio::test]
async fn test_two_nodes_say_hello() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    // Both sides derived the same session key
    let a_view = alice.net.list_active_peers().await;
    let b_view = bob.net.list_active_peers().await;
    assert_eq!(a_view.len(), 1);
    assert_eq!(b_view.len(), 1);
    assert_eq!(a_view[0].session_fingerprint, b_view[0].session_fingerprint);
    assert_eq!(a_view[0].name, "bob");
    assert_eq!(b_view[0].name, "alice");
    assert_eq!(a_view[0].state, PeerState::Established);
    assert_eq!(b_view[0].state, PeerState::Established);

    alice.net.send_public_message("hello").await.unwrap();
    assert!(wait_for(|| async { bob.history_contents().await == vec!["hello"] }).await);

    let received = &bob.net.chat_history().await[0];
    assert_eq!(received.sender, "alice");
    assert!(!received.is_own);
    assert!(!received.is_private);

    let sent = &alice.net.chat_history().await[0];
    assert!(sent.is_own);
    assert_eq!(sent.content, "hello");

    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_private_message_reaches_only_target() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    let carol = TestNode::spawn("carol").await;
    alice.connect(&bob).await;
    alice.connect(&carol).await;

    alice.net.send_private_message("bob", "for bob only").await.unwrap();
    assert!(wait_for(|| async { bob.history_contents().await == vec!["for bob only"] }).await);
    assert!(bob.net.chat_history().await[0].is_private);

    // Flush carol's pipe with a public message, then check nothing else arrived
    alice.net.send_public_message("everyone").await.unwrap();
    assert!(wait_for(|| async { !carol.history_contents().await.is_empty() }).await);
    assert_eq!(carol.history_contents().await, vec!["everyone"]);

    for node in [&alice, &bob, &carol] {
        node.net.shutdown().await;
    }
}

#[tokio::test]
async fn test_block_then_unblock() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let alice_addr: SocketAddr = bob.net.list_active_peers().await[0].addr;
    bob.net.set_blocked(alice_addr, true).await;
    assert_eq!(bob.net.blocked_peers().await, vec![alice_addr]);

    alice.net.send_public_message("one").await.unwrap();
    // update_name is dispatched after "one" on the same connection
    alice.net.rename_self("alicia").await.unwrap();
    assert!(wait_for(|| async {
        bob.net.list_active_peers().await.iter().any(|p| p.name == "alicia")
    })
    .await);
    assert!(bob.net.chat_history().await.is_empty());

    // Blocking keeps the session up
    let peers = bob.net.list_active_peers().await;
    assert_eq!(peers.len(), 1);
    assert!(peers[0].blocked);

    bob.net.set_blocked(alice_addr, false).await;
    alice.net.send_public_message("two").await.unwrap();
    assert!(wait_for(|| async { !bob.history_contents().await.is_empty() }).await);
    assert_eq!(bob.history_contents().await, vec!["two"]);
    assert_eq!(bob.net.chat_history().await[0].sender, "alicia");

    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_connects_make_one_session() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;

    let addr = bob.net.listen_addr();
    let id = bob.net.id().to_string();
    let dials: Vec<_> = (0..8)
        .map(|_| {
            let net = alice.net.clone();
            let id = id.clone();
            tokio::spawn(async move { net.connect_to_peer(addr, &id, "bob").await })
        })
        .collect();
    for dial in dials {
        dial.await.unwrap();
    }

    let alice_id = alice.net.id().to_string();
    assert!(wait_for(|| async { established_with(&bob.net, &alice_id).await }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(alice.net.list_active_peers().await.len(), 1);
    assert_eq!(bob.net.list_active_peers().await.len(), 1);

    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_peer() {
    let mut alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    bob.net.shutdown().await;

    let gone = loop {
        match tokio::time::timeout(WAIT_LIMIT, alice.events.recv()).await {
            Ok(Some(NetEvent::PeerDisconnected { name, .. })) => break name,
            Ok(Some(_)) => continue,
            other => panic!("no PeerDisconnected event: {:?}", other),
        }
    };
    assert_eq!(gone, "bob");
    assert!(alice.net.list_active_peers().await.is_empty());

    alice.net.shutdown().await;
}

// =============================================================================
// FILE TRANSFER
// =============================================================================

async fn offer_and_wait(sender: &TestNode, receiver: &TestNode, path: &PathBuf) -> String {
    let receiver_name = receiver.net.display_name().await;
    let file_id = sender.net.request_file_send(path, &receiver_name).await.unwrap();
    assert_eq!(file_id.len(), 16);

    assert!(wait_for(|| async {
        receiver
            .net
            .list_transfers()
            .await
            .iter()
            .any(|t| t.file_id == file_id && t.status == TransferStatus::Pending)
    })
    .await);
    file_id
}

async fn status_of(net: &Network, file_id: &str) -> Option<TransferStatus> {
    net.list_transfers()
        .await
        .into_iter()
        .find(|t| t.file_id == file_id)
        .map(|t| t.status)
}

#[tokio::test]
async fn test_file_transfer_multi_chunk() {
    let alice = TestNode::spawn_with("alice", |c| c.chunk_size = 1024).await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let contents: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let src = temp_file("multi", &contents);
    let file_id = offer_and_wait(&alice, &bob, &src).await;

    bob.net.respond_to_file_transfer(&file_id, true).await.unwrap();

    assert!(wait_for(|| async {
        status_of(&bob.net, &file_id).await == Some(TransferStatus::Completed)
            && status_of(&alice.net, &file_id).await == Some(TransferStatus::Completed)
    })
    .await);

    let record = bob.net.list_transfers().await.remove(0);
    assert_eq!(record.bytes_transferred, 5000);
    assert!(record.end_time.is_some());
    let saved = record.file_path.expect("receiver path");
    assert!(saved.starts_with(&bob.download_dir));
    assert_eq!(std::fs::read(saved).unwrap(), contents);

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_zero_size_file_sends_one_chunk() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let src = temp_file("empty", b"");
    let file_id = offer_and_wait(&alice, &bob, &src).await;
    bob.net.respond_to_file_transfer(&file_id, true).await.unwrap();

    assert!(wait_for(|| async {
        status_of(&bob.net, &file_id).await == Some(TransferStatus::Completed)
    })
    .await);

    let record = bob.net.list_transfers().await.remove(0);
    assert_eq!(record.bytes_transferred, 0);
    assert_eq!(std::fs::metadata(record.file_path.unwrap()).unwrap().len(), 0);

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_rejected_offer_sends_nothing() {
    let alice = TestNode::spawn("alice").await;
    let mut bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let src = temp_file("reject", b"not wanted");
    let file_id = offer_and_wait(&alice, &bob, &src).await;

    let offered = loop {
        match tokio::time::timeout(WAIT_LIMIT, bob.events.recv()).await {
            Ok(Some(NetEvent::FileOffered(record))) => break record,
            Ok(Some(_)) => continue,
            other => panic!("no FileOffered event: {:?}", other),
        }
    };
    assert_eq!(offered.file_id, file_id);
    assert_eq!(offered.peer_name, "alice");
    assert_eq!(offered.file_size, 10);

    bob.net.respond_to_file_transfer(&file_id, false).await.unwrap();
    assert!(wait_for(|| async {
        status_of(&alice.net, &file_id).await == Some(TransferStatus::Failed)
    })
    .await);

    assert_eq!(status_of(&bob.net, &file_id).await, Some(TransferStatus::Failed));
    assert_eq!(alice.net.list_transfers().await[0].bytes_transferred, 0);
    assert!(!bob.download_dir.exists());

    // A second answer is a state error
    assert!(bob.net.respond_to_file_transfer(&file_id, true).await.is_err());

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_offer_fails_on_both_sides() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let src = temp_file("cancel", b"changed my mind");
    let file_id = offer_and_wait(&alice, &bob, &src).await;

    alice.net.cancel_transfer(&file_id).await.unwrap();
    assert_eq!(status_of(&alice.net, &file_id).await, Some(TransferStatus::Failed));
    assert!(wait_for(|| async {
        status_of(&bob.net, &file_id).await == Some(TransferStatus::Failed)
    })
    .await);

    // Accepting a withdrawn offer is a state error and saves nothing
    let late = bob.net.respond_to_file_transfer(&file_id, true).await;
    assert!(matches!(late, Err(NetError::InvalidTransferState { .. })));
    assert!(!bob.download_dir.exists());

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_accept_crossing_cancel_still_fails() {
    let alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let src = temp_file("crossing", b"changed my mind");
    let file_id = offer_and_wait(&alice, &bob, &src).await;

    // The accept may land before or after the withdrawal; either way nothing streams
    alice.net.cancel_transfer(&file_id).await.unwrap();
    let _ = bob.net.respond_to_file_transfer(&file_id, true).await;

    assert!(wait_for(|| async {
        status_of(&bob.net, &file_id).await == Some(TransferStatus::Failed)
    })
    .await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status_of(&alice.net, &file_id).await, Some(TransferStatus::Failed));
    assert_eq!(bob.net.list_transfers().await[0].bytes_transferred, 0);
    assert_eq!(alice.net.list_transfers().await[0].bytes_transferred, 0);

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
    bob.net.shutdown().await;
}

#[tokio::test]
async fn test_lost_peer_fails_open_offer() {
    let mut alice = TestNode::spawn("alice").await;
    let bob = TestNode::spawn("bob").await;
    alice.connect(&bob).await;

    let src = temp_file("lost", b"never delivered");
    let file_id = offer_and_wait(&alice, &bob, &src).await;

    bob.net.shutdown().await;

    let finished = loop {
        match tokio::time::timeout(WAIT_LIMIT, alice.events.recv()).await {
            Ok(Some(NetEvent::TransferFinished { file_id, status })) => break (file_id, status),
            Ok(Some(_)) => continue,
            other => panic!("no TransferFinished event: {:?}", other),
        }
    };
    assert_eq!(finished, (file_id.clone(), TransferStatus::Failed));
    assert_eq!(status_of(&alice.net, &file_id).await, Some(TransferStatus::Failed));

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
}

#[tokio::test]
async fn test_offer_to_unknown_peer_fails() {
    let alice = TestNode::spawn("alice").await;
    let src = temp_file("unknown", b"x");

    assert!(alice.net.request_file_send(&src, "nobody").await.is_err());
    assert!(alice.net.list_transfers().await.is_empty());

    std::fs::remove_file(src).ok();
    alice.net.shutdown().await;
}

// =============================================================================
// DISCOVERY
// =============================================================================

async fn observer_socket() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn announce_of(node: &TestNode) -> DiscoveryPacket {
    DiscoveryPacket {
        kind: DiscoveryKind::Announce,
        id: node.net.id().to_string(),
        name: node.net.display_name().await,
        ip: "127.0.0.1".into(),
        port: node.net.listen_addr().port(),
    }
}

#[tokio::test]
async fn test_discovery_ignores_own_echo() {
    let alice = TestNode::spawn("alice").await;
    let (observer, observer_addr) = observer_socket().await;

    let echo = announce_of(&alice).await;
    let action = alice.net.handle_discovery_packet(echo, observer_addr).await;
    assert_eq!(action, DiscoveryAction::Ignore);

    let mut buf = [0u8; 1024];
    let reply = tokio::time::timeout(Duration::from_millis(200), observer.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "echo must not be answered");
    assert!(alice.net.list_active_peers().await.is_empty());

    alice.net.shutdown().await;
}

#[tokio::test]
async fn test_discovery_announce_connects_smaller_id() {
    let first = TestNode::spawn("alice").await;
    let second = TestNode::spawn("bob").await;
    let (small, large) = if first.net.id() < second.net.id() {
        (&first, &second)
    } else {
        (&second, &first)
    };
    let (observer, observer_addr) = observer_socket().await;

    // The larger ID only answers
    let action = large
        .net
        .handle_discovery_packet(announce_of(small).await, observer_addr)
        .await;
    assert_eq!(action, DiscoveryAction::Reply);

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), observer.recv_from(&mut buf))
        .await
        .expect("response")
        .unwrap();
    let response: DiscoveryPacket = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(response.kind, DiscoveryKind::Response);
    assert_eq!(response.id, large.net.id());
    assert_eq!(response.port, large.net.listen_addr().port());

    // The smaller ID answers and dials
    let action = small
        .net
        .handle_discovery_packet(announce_of(large).await, observer_addr)
        .await;
    assert_eq!(action, DiscoveryAction::ConnectAndReply);

    let large_id = large.net.id().to_string();
    let small_id = small.net.id().to_string();
    assert!(wait_for(|| async {
        established_with(&small.net, &large_id).await && established_with(&large.net, &small_id).await
    })
    .await);

    // Now known: further announces are ignored
    let again = small
        .net
        .handle_discovery_packet(announce_of(large).await, observer_addr)
        .await;
    assert_eq!(again, DiscoveryAction::Ignore);

    first.net.shutdown().await;
    second.net.shutdown().await;
}
