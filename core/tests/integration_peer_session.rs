//! Peer session scenarios over the in-memory transport
//!
//! Two or more `PeerManager`s share one `MemoryNetwork` and talk through
//! real channels: connection lifecycle, handshake, chat, file transfer,
//! timeouts and backend recovery.
//!
//! Run with: cargo test --test integration_peer_session

use parking_lot::Mutex;
use peerlink_core::error::{PeerLinkError, TransportError};
use peerlink_core::message::{ContactInfo, FileChunk, FileFrame, FileMetadata, Payload};
use peerlink_core::store::{
    Contact, ContactStore, DeliveryStatus, MemoryContactStore, MemoryMessageStore, MessageDirection,
    MessageKind, MessageStore, Notifier, Presence,
};
use peerlink_core::transport::memory::{BackendState, MemoryBackend};
use peerlink_core::{
    Collaborators, ConnectionState, ManagerConfig, MemoryNetwork, OutgoingFile, PeerEvent,
    PeerIdentity, PeerManager, RegisterOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<(String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.seen.lock().push((title.to_string(), body.to_string()));
    }
}

struct Peer {
    manager: PeerManager,
    backend: Arc<MemoryBackend>,
    contacts: Arc<MemoryContactStore>,
    messages: Arc<MemoryMessageStore>,
    notifier: Arc<RecordingNotifier>,
    events: UnboundedReceiver<PeerEvent>,
}

async fn peer(network: &MemoryNetwork, id: &str, name: &str) -> Peer {
    let backend = network.backend();
    let contacts = Arc::new(MemoryContactStore::new());
    let messages = Arc::new(MemoryMessageStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = PeerManager::new(
        ManagerConfig::default(),
        Collaborators {
            identity: Arc::new(PeerIdentity::new(id, name)),
            contacts: contacts.clone(),
            messages: messages.clone(),
            notifier: notifier.clone(),
        },
        backend.clone(),
    );
    let events = manager.subscribe_events();
    assert_eq!(
        manager.register_peer().await.expect("Failed to register"),
        RegisterOutcome::Initialized
    );
    Peer {
        manager,
        backend,
        contacts,
        messages,
        notifier,
        events,
    }
}

async fn wait_for<F>(
    events: &mut UnboundedReceiver<PeerEvent>,
    within: Duration,
    matches: F,
) -> PeerEvent
where
    F: Fn(&PeerEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("Event stream closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

const WAIT: Duration = Duration::from_secs(5);

/// Poll `done` until it holds or `WAIT` runs out
async fn settle<F>(what: &str, done: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn is_connected(peer_id: &'static str) -> impl Fn(&PeerEvent) -> bool {
    move |event| {
        matches!(event, PeerEvent::StateChanged { peer_id: p, state: ConnectionState::Connected } if p == peer_id)
    }
}

#[tokio::test]
async fn test_concurrent_connects_share_one_record() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    let (first, second) = tokio::join!(
        alice.manager.connect_to_peer("b1"),
        alice.manager.connect_to_peer("b1")
    );
    first.expect("First connect failed");
    second.expect("Second connect failed");
    alice.manager.connect_to_peer("b1").await.expect("Reconnect failed");

    assert_eq!(alice.manager.connection_count(), 1);
    assert!(alice.manager.is_connected("b1"));

    wait_for(&mut bob.events, WAIT, is_connected("a1")).await;
    assert_eq!(bob.manager.connection_count(), 1);
    assert_eq!(bob.manager.connection_state("a1"), ConnectionState::Connected);
}

#[tokio::test]
async fn test_handshake_adds_initiator_once() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    alice.manager.connect_to_peer("b1").await.unwrap();
    match wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::ContactAdded(_))).await {
        PeerEvent::ContactAdded(contact) => {
            assert_eq!(contact.peer_id, "a1");
            assert_eq!(contact.display_name, "Alice");
            assert_eq!(contact.presence, Presence::Online);
        }
        other => panic!("Unexpected event {:?}", other),
    }

    // Reconnect: introduction is sent again but the contact already exists
    alice.manager.disconnect("b1");
    alice.manager.connect_to_peer("b1").await.unwrap();
    assert!(alice.manager.send_message("b1", "sync"));
    wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::ChatReceived(_))).await;

    assert_eq!(bob.contacts.len(), 1);
    assert_eq!(
        *bob.notifier.seen.lock(),
        vec![(
            "New contact".to_string(),
            "Alice added you as a contact".to_string()
        )]
    );
}

#[tokio::test]
async fn test_spoofed_contact_info_rejected() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    alice.manager.connect_to_peer("b1").await.unwrap();
    assert!(alice.manager.send(
        "b1",
        Payload::ContactInfo(ContactInfo {
            peer_id: Some("X".to_string()),
            display_name: "Mallory".to_string(),
        })
    ));
    assert!(alice.manager.send_message("b1", "after"));
    wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::ChatReceived(_))).await;

    assert!(bob.contacts.get_by_peer_id("X").unwrap().is_none());
    assert!(bob.contacts.get_by_peer_id("a1").unwrap().is_some());
}

#[tokio::test]
async fn test_chat_roundtrip_and_delivery_status() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    alice.manager.connect_to_peer("b1").await.unwrap();
    assert!(alice.manager.send_message("b1", "hello bob"));

    match wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::ChatReceived(_))).await {
        PeerEvent::ChatReceived(message) => {
            assert_eq!(message.content, "hello bob");
            assert_eq!(message.contact_ref, "a1");
            assert_eq!(message.direction, MessageDirection::Incoming);
            assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
        }
        other => panic!("Unexpected event {:?}", other),
    }

    let sent = alice.messages.list_by_contact("b1").unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].delivery_status, DeliveryStatus::Sent);
    assert_eq!(bob.messages.list_by_contact("a1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_forty_kib_file_reassembled() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    let bytes: Vec<u8> = (0..40 * 1024).map(|i| (i % 251) as u8).collect();
    let file = OutgoingFile::new("scan.pdf", "application/pdf", bytes.clone());

    alice.manager.connect_to_peer("b1").await.unwrap();
    assert!(alice.manager.send_file("b1", &file));

    match wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::FileReceived(_))).await {
        PeerEvent::FileReceived(received) => {
            assert_eq!(received.name, "scan.pdf");
            assert_eq!(received.mime_type, "application/pdf");
            assert_eq!(received.bytes, bytes);
        }
        other => panic!("Unexpected event {:?}", other),
    }
    assert_eq!(bob.manager.active_transfers(), 0);

    let history = bob.messages.list_by_contact("a1").unwrap();
    assert!(history.iter().any(|m| m.kind == MessageKind::File && m.content == "scan.pdf"));
    let sent = alice.messages.list_by_contact("b1").unwrap();
    assert_eq!(sent[0].delivery_status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn test_hostile_file_metadata_leaves_session_running() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    alice.manager.connect_to_peer("b1").await.unwrap();
    for (size, chunk_count) in [(1u64 << 60, 1u32), (10, u32::MAX), (0, 4)] {
        assert!(alice.manager.send(
            "b1",
            Payload::File(FileFrame::Metadata(FileMetadata {
                name: "huge.bin".to_string(),
                size,
                mime_type: "application/octet-stream".to_string(),
                chunk_count,
                preview: None,
            }))
        ));
    }
    assert!(alice.manager.send(
        "b1",
        Payload::File(FileFrame::Chunk(FileChunk {
            file_id: "unknown".to_string(),
            chunk_index: 0,
            data: vec![1],
        }))
    ));
    assert!(alice.manager.send_message("b1", "still here"));

    match wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::ChatReceived(_))).await {
        PeerEvent::ChatReceived(message) => assert_eq!(message.content, "still here"),
        other => panic!("Unexpected event {:?}", other),
    }
    assert_eq!(bob.manager.active_transfers(), 0);
    assert!(bob.manager.is_connected("a1"));
    assert!(bob
        .messages
        .list_by_contact("a1")
        .unwrap()
        .iter()
        .all(|m| m.kind == MessageKind::Text));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_connects_settle_on_one_channel() {
    for round in 0..25 {
        let network = MemoryNetwork::new();
        let alice = peer(&network, "a1", "Alice").await;
        let bob = peer(&network, "b1", "Bob").await;

        let to_bob = {
            let manager = alice.manager.clone();
            tokio::spawn(async move { manager.connect_to_peer("b1").await })
        };
        let to_alice = {
            let manager = bob.manager.clone();
            tokio::spawn(async move { manager.connect_to_peer("a1").await })
        };
        if let Err(e) = to_bob.await.unwrap() {
            panic!("Round {}: alice failed to connect: {}", round, e);
        }
        if let Err(e) = to_alice.await.unwrap() {
            panic!("Round {}: bob failed to connect: {}", round, e);
        }

        settle("both sides connected", || {
            alice.manager.connected_peers() == ["b1"] && bob.manager.connected_peers() == ["a1"]
        })
        .await;
        assert_eq!(alice.manager.connection_count(), 1);
        assert_eq!(bob.manager.connection_count(), 1);

        // The surviving channel still carries traffic both ways
        assert!(alice.manager.send_message("b1", "ping"));
        assert!(bob.manager.send_message("a1", "pong"));
        settle("chat exchanged", || {
            alice.messages.list_by_contact("b1").unwrap().len() == 2
                && bob.messages.list_by_contact("a1").unwrap().len() == 2
        })
        .await;

        // Exactly one side introduced itself
        settle("introduction", || alice.contacts.len() + bob.contacts.len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alice.contacts.len() + bob.contacts.len(), 1, "round {}", round);
        assert_eq!(
            alice.notifier.seen.lock().len() + bob.notifier.seen.lock().len(),
            1,
            "round {}",
            round
        );
    }
}

#[tokio::test]
async fn test_disconnect_then_send_fails() {
    let network = MemoryNetwork::new();
    let mut alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    alice.manager.connect_to_peer("b1").await.unwrap();
    wait_for(&mut bob.events, WAIT, is_connected("a1")).await;

    alice.manager.disconnect("b1");
    assert_eq!(alice.manager.connection_state("b1"), ConnectionState::Disconnected);
    wait_for(&mut bob.events, WAIT, |e| {
        matches!(e, PeerEvent::StateChanged { state: ConnectionState::Disconnected, .. })
    })
    .await;

    assert!(!alice.manager.send_message("b1", "anyone?"));
    assert!(!alice.manager.send_file("b1", &OutgoingFile::new("a", "text/plain", vec![1])));
    let failed = alice.messages.list_by_contact("b1").unwrap();
    assert!(failed.iter().all(|m| m.delivery_status == DeliveryStatus::Failed));

    // Nothing else pending for alice beyond state changes
    while let Ok(event) = alice.events.try_recv() {
        assert!(matches!(event, PeerEvent::StateChanged { .. }));
    }
}

#[tokio::test]
async fn test_presence_follows_connection_state() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let _bob = peer(&network, "b1", "Bob").await;
    alice.contacts.upsert(Contact::new("b1", "Bob")).unwrap();

    let mut first = alice.manager.subscribe_status("b1");
    let mut status = alice.manager.subscribe_status("b1");

    alice.manager.connect_to_peer("b1").await.unwrap();
    let bob_contact = alice.contacts.get_by_peer_id("b1").unwrap().unwrap();
    assert_eq!(bob_contact.presence, Presence::Online);
    assert!(bob_contact.last_seen.is_some());

    alice.manager.disconnect("b1");
    let bob_contact = alice.contacts.get_by_peer_id("b1").unwrap().unwrap();
    assert_eq!(bob_contact.presence, Presence::Offline);

    assert_eq!(status.recv().await, Some(ConnectionState::Connecting));
    assert_eq!(status.recv().await, Some(ConnectionState::Connected));
    assert_eq!(status.recv().await, Some(ConnectionState::Disconnected));
    assert!(first.try_recv().is_err());
}

#[tokio::test]
async fn test_ensure_connection_reports_bool() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let _bob = peer(&network, "b1", "Bob").await;

    assert!(alice.manager.ensure_connection("b1").await);
    assert!(alice.manager.ensure_connection("b1").await);
    assert!(!alice.manager.ensure_connection("nobody").await);
    assert_eq!(alice.manager.connection_state("nobody"), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_connect_times_out_to_failed() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    network.set_unresponsive("ghost");

    let started = tokio::time::Instant::now();
    let err = alice.manager.connect_to_peer("ghost").await.unwrap_err();
    assert_eq!(
        err,
        PeerLinkError::Transport(TransportError::Timeout {
            peer: "ghost".to_string(),
            timeout_ms: 15_000,
        })
    );
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(alice.manager.connection_state("ghost"), ConnectionState::Failed);

    // Failed -> Connecting on an explicit retry
    assert!(alice.manager.connect_to_peer("ghost").await.is_err());
    assert_eq!(alice.manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_open_fails_at_the_deadline() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    network.set_stalled("slow");

    let started = tokio::time::Instant::now();
    let joiner = {
        let manager = alice.manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            manager.connect_to_peer("slow").await
        })
    };

    let err = alice.manager.connect_to_peer("slow").await.unwrap_err();
    assert_eq!(
        err,
        PeerLinkError::Transport(TransportError::Timeout {
            peer: "slow".to_string(),
            timeout_ms: 15_000,
        })
    );
    assert_eq!(alice.manager.connection_state("slow"), ConnectionState::Failed);

    // The caller that joined the attempt is released by the same failure
    assert!(joiner.await.unwrap().is_err());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(15));
    assert!(elapsed < Duration::from_secs(16));
}

#[tokio::test(start_paused = true)]
async fn test_register_debounced_within_cooldown() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;

    assert_eq!(
        alice.manager.register_peer().await.unwrap(),
        RegisterOutcome::CoolingDown
    );
    assert_eq!(alice.backend.initialize_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_backend_error_reinitializes_once() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;

    alice.backend.emit_error("ice candidate failed", false);
    alice.backend.simulate_server_failure();
    assert_eq!(alice.backend.state(), BackendState::Destroyed);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(alice.backend.initialize_count(), 2);
    assert!(network.is_attached("a1"));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(alice.backend.initialize_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_transfer_expires() {
    let network = MemoryNetwork::new();
    let alice = peer(&network, "a1", "Alice").await;
    let mut bob = peer(&network, "b1", "Bob").await;

    alice.manager.connect_to_peer("b1").await.unwrap();
    assert!(alice.manager.send(
        "b1",
        Payload::File(FileFrame::Metadata(FileMetadata {
            name: "partial.bin".to_string(),
            size: 48 * 1024,
            mime_type: "application/octet-stream".to_string(),
            chunk_count: 3,
            preview: None,
        }))
    ));
    assert!(alice.manager.send_message("b1", "sync"));
    wait_for(&mut bob.events, WAIT, |e| matches!(e, PeerEvent::ChatReceived(_))).await;
    assert_eq!(bob.manager.active_transfers(), 1);

    match wait_for(&mut bob.events, Duration::from_secs(300), |e| {
        matches!(e, PeerEvent::TransferExpired(_))
    })
    .await
    {
        PeerEvent::TransferExpired(expired) => {
            assert!(expired.to_string().contains("0/3"));
        }
        other => panic!("Unexpected event {:?}", other),
    }
    assert_eq!(bob.manager.active_transfers(), 0);
}
