//! Relay Server — maps peer ids to live signaling sockets and forwards frames
//!
//! The relay holds no message content. Each socket is represented by the
//! sending half of an unbounded channel; the websocket plumbing that pumps
//! that channel lives with whoever hosts the server.

use super::protocol::{ClientMessage, ServerMessage, STATUS_OFFLINE, STATUS_ONLINE};
use crate::time::current_timestamp_ms;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier of one accepted socket
pub type ConnectionId = u64;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrent sockets
    pub max_connections: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayServerStats {
    /// Number of open sockets
    pub connections_active: usize,
    /// Number of peer ids currently bound to a socket
    pub peers_registered: usize,
    /// Frames delivered to a target socket
    pub frames_forwarded: u64,
    /// Forwarding frames whose target was unavailable
    pub frames_rejected: u64,
    /// Frames that failed to parse
    pub frames_malformed: u64,
}

/// Relay server error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayServerError {
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
}

struct SocketEntry {
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Peer id this socket registered as, while it still owns the binding
    peer_id: Option<String>,
}

#[derive(Default)]
struct RelayState {
    sockets: HashMap<ConnectionId, SocketEntry>,
    /// peer_id -> socket; last registration wins
    peers: HashMap<String, ConnectionId>,
}

#[derive(Default)]
struct Counters {
    forwarded: u64,
    rejected: u64,
    malformed: u64,
}

/// The coordination relay
pub struct RelayServer {
    config: RelayServerConfig,
    next_id: AtomicU64,
    state: RwLock<RelayState>,
    counters: RwLock<Counters>,
}

impl RelayServer {
    /// Create a new relay server with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    /// Create a new relay server with custom configuration
    pub fn with_config(config: RelayServerConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            state: RwLock::new(RelayState::default()),
            counters: RwLock::new(Counters::default()),
        }
    }

    /// Accept a new socket. The returned receiver yields every frame the
    /// relay wants written to that socket.
    pub fn connect(
        &self,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<ServerMessage>), RelayServerError> {
        let mut state = self.state.write();
        if state.sockets.len() >= self.config.max_connections {
            return Err(RelayServerError::ConnectionLimitExceeded);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.sockets.insert(id, SocketEntry { tx, peer_id: None });
        debug!(connection = id, "Relay socket accepted");
        Ok((id, rx))
    }

    /// Handle one raw text frame from a socket. Malformed frames get an
    /// `error` reply; the socket is never closed because of one.
    pub fn handle_text(&self, conn: ConnectionId, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle_message(conn, msg),
            Err(e) => {
                debug!(connection = conn, "Malformed relay frame: {}", e);
                self.counters.write().malformed += 1;
                self.reply(conn, ServerMessage::error(format!("invalid message: {}", e)));
            }
        }
    }

    /// Reject a frame that cannot be parsed at all (e.g. binary)
    pub fn reject_frame(&self, conn: ConnectionId, reason: &str) {
        self.counters.write().malformed += 1;
        self.reply(conn, ServerMessage::error(reason));
    }

    /// Handle one decoded client frame
    pub fn handle_message(&self, conn: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Register {
                peer_id,
                display_name,
            } => self.register(conn, peer_id, display_name),
            ClientMessage::StatusUpdate { status } => self.status_update(conn, status),
            ClientMessage::Ping => self.reply(conn, ServerMessage::Pong),
            forwarding => self.forward(conn, forwarding),
        }
    }

    /// Socket closed: drop its registration and tell everyone it went offline
    pub fn disconnect(&self, conn: ConnectionId) {
        let gone = {
            let mut state = self.state.write();
            let Some(entry) = state.sockets.remove(&conn) else {
                return;
            };
            match entry.peer_id {
                Some(peer_id) if state.peers.get(&peer_id) == Some(&conn) => {
                    state.peers.remove(&peer_id);
                    Some(peer_id)
                }
                _ => None,
            }
        };

        if let Some(peer_id) = gone {
            info!(%peer_id, "Peer went offline");
            self.broadcast_all(ServerMessage::PeerStatus {
                peer_id,
                status: STATUS_OFFLINE.to_string(),
                timestamp: current_timestamp_ms(),
            });
        }
    }

    /// Check if a peer id is bound to a live socket
    pub fn is_registered(&self, peer_id: &str) -> bool {
        let state = self.state.read();
        state
            .peers
            .get(peer_id)
            .and_then(|id| state.sockets.get(id))
            .map_or(false, |entry| !entry.tx.is_closed())
    }

    /// Peer ids currently registered
    pub fn registered_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.state.read().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Get current server statistics
    pub fn get_stats(&self) -> RelayServerStats {
        let state = self.state.read();
        let counters = self.counters.read();
        RelayServerStats {
            connections_active: state.sockets.len(),
            peers_registered: state.peers.len(),
            frames_forwarded: counters.forwarded,
            frames_rejected: counters.rejected,
            frames_malformed: counters.malformed,
        }
    }

    fn register(&self, conn: ConnectionId, peer_id: String, display_name: String) {
        let superseded = {
            let mut guard = self.state.write();
            let RelayState { sockets, peers } = &mut *guard;

            let Some(entry) = sockets.get_mut(&conn) else {
                return;
            };
            if let Some(old_id) = entry.peer_id.replace(peer_id.clone()) {
                if old_id != peer_id && peers.get(&old_id) == Some(&conn) {
                    peers.remove(&old_id);
                }
            }

            let previous = peers.insert(peer_id.clone(), conn);
            match previous {
                Some(prev) if prev != conn => {
                    // The old socket keeps its connection but loses the id,
                    // so its eventual close does not unbind the new one.
                    if let Some(prev_entry) = sockets.get_mut(&prev) {
                        prev_entry.peer_id = None;
                    }
                    Some(prev)
                }
                _ => None,
            }
        };

        if let Some(prev) = superseded {
            warn!(
                %peer_id,
                previous_connection = prev,
                "Peer id re-registered; previous socket superseded"
            );
        }
        info!(%peer_id, %display_name, connection = conn, "Peer registered");

        self.reply(
            conn,
            ServerMessage::Registered {
                peer_id: peer_id.clone(),
            },
        );
        self.broadcast(
            Some(conn),
            ServerMessage::PeerStatus {
                peer_id,
                status: STATUS_ONLINE.to_string(),
                timestamp: current_timestamp_ms(),
            },
        );
    }

    fn status_update(&self, conn: ConnectionId, status: String) {
        let peer_id = self
            .state
            .read()
            .sockets
            .get(&conn)
            .and_then(|entry| entry.peer_id.clone());

        match peer_id {
            Some(peer_id) => self.broadcast(
                Some(conn),
                ServerMessage::PeerStatus {
                    peer_id,
                    status,
                    timestamp: current_timestamp_ms(),
                },
            ),
            None => self.reply(conn, ServerMessage::error("register before sending status")),
        }
    }

    fn forward(&self, conn: ConnectionId, msg: ClientMessage) {
        let kind = msg.message_type();
        let (target, delivered) = {
            let state = self.state.read();
            let from = state
                .sockets
                .get(&conn)
                .and_then(|entry| entry.peer_id.clone())
                .or_else(|| msg.claimed_from().map(str::to_string));

            let Some(from) = from else {
                drop(state);
                self.reply(conn, ServerMessage::error("register before forwarding"));
                return;
            };
            let Some((target, forwarded)) = msg.into_forwarded(from) else {
                return;
            };

            let delivered = state
                .peers
                .get(&target)
                .and_then(|id| state.sockets.get(id))
                .map_or(false, |entry| {
                    !entry.tx.is_closed() && entry.tx.send(forwarded).is_ok()
                });
            if !delivered {
                debug!(%target, kind, "Forward target not available");
            }
            (target, delivered)
        };

        if delivered {
            self.counters.write().forwarded += 1;
        } else {
            self.counters.write().rejected += 1;
            self.reply(conn, ServerMessage::target_unavailable(target));
        }
    }

    fn reply(&self, conn: ConnectionId, msg: ServerMessage) {
        if let Some(entry) = self.state.read().sockets.get(&conn) {
            let _ = entry.tx.send(msg);
        }
    }

    /// Send to every open socket, registered or not
    fn broadcast_all(&self, msg: ServerMessage) {
        for entry in self.state.read().sockets.values() {
            let _ = entry.tx.send(msg.clone());
        }
    }

    /// Send to every registered socket, optionally skipping one
    fn broadcast(&self, except: Option<ConnectionId>, msg: ServerMessage) {
        let state = self.state.read();
        for id in state.peers.values() {
            if Some(*id) == except {
                continue;
            }
            if let Some(entry) = state.sockets.get(id) {
                let _ = entry.tx.send(msg.clone());
            }
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn register(server: &RelayServer, peer_id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (conn, mut rx) = server.connect().expect("Failed to connect");
        server.handle_message(
            conn,
            ClientMessage::Register {
                peer_id: peer_id.to_string(),
                display_name: peer_id.to_uppercase(),
            },
        );
        let frames = drain(&mut rx);
        assert!(frames.contains(&ServerMessage::Registered {
            peer_id: peer_id.to_string()
        }));
        (conn, rx)
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::new();
        assert_eq!(server.get_stats(), RelayServerStats::default());
    }

    #[test]
    fn test_connection_limit() {
        let server = RelayServer::with_config(RelayServerConfig { max_connections: 1 });
        assert!(server.connect().is_ok());
        assert_eq!(
            server.connect().unwrap_err(),
            RelayServerError::ConnectionLimitExceeded
        );
    }

    #[test]
    fn test_ping_pong() {
        let server = RelayServer::new();
        let (conn, mut rx) = server.connect().unwrap();
        server.handle_text(conn, r#"{"type":"ping"}"#);
        assert_eq!(drain(&mut rx), vec![ServerMessage::Pong]);
    }

    #[test]
    fn test_register_broadcasts_online() {
        let server = RelayServer::new();
        let (_a, mut a_rx) = register(&server, "a1");
        let (_b, _b_rx) = register(&server, "b1");

        match drain(&mut a_rx).as_slice() {
            [ServerMessage::PeerStatus {
                peer_id, status, ..
            }] => {
                assert_eq!(peer_id, "b1");
                assert_eq!(status, STATUS_ONLINE);
            }
            other => panic!("Unexpected frames: {:?}", other),
        }
        assert!(server.is_registered("a1"));
        assert_eq!(server.registered_peers(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_forward_signal_stamps_sender() {
        let server = RelayServer::new();
        let (a, _a_rx) = register(&server, "a1");
        let (_b, mut b_rx) = register(&server, "b1");

        server.handle_message(
            a,
            ClientMessage::Signal {
                to: "b1".to_string(),
                from: Some("spoofed".to_string()),
                signal: json!({"sdp": "x"}),
            },
        );

        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::Signal {
                from: "a1".to_string(),
                signal: json!({"sdp": "x"}),
            }]
        );
        assert_eq!(server.get_stats().frames_forwarded, 1);
    }

    #[test]
    fn test_forward_to_unknown_target_errors() {
        let server = RelayServer::new();
        let (a, mut a_rx) = register(&server, "a1");

        server.handle_message(
            a,
            ClientMessage::Answer {
                to: "ghost".to_string(),
                from: None,
                answer: json!({}),
            },
        );

        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::target_unavailable("ghost")]
        );
        assert_eq!(server.get_stats().frames_rejected, 1);
    }

    #[test]
    fn test_forward_to_closed_socket_errors() {
        let server = RelayServer::new();
        let (a, mut a_rx) = register(&server, "a1");
        let (_b, b_rx) = register(&server, "b1");
        drop(b_rx);
        drain(&mut a_rx);

        server.handle_message(
            a,
            ClientMessage::Offer {
                to: "b1".to_string(),
                from: None,
                offer: json!({}),
                call_type: None,
            },
        );
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::target_unavailable("b1")]
        );
    }

    #[test]
    fn test_status_update_skips_sender() {
        let server = RelayServer::new();
        let (a, mut a_rx) = register(&server, "a1");
        let (_b, mut b_rx) = register(&server, "b1");
        drain(&mut a_rx);

        server.handle_message(
            a,
            ClientMessage::StatusUpdate {
                status: "away".to_string(),
            },
        );

        assert!(drain(&mut a_rx).is_empty());
        match drain(&mut b_rx).as_slice() {
            [ServerMessage::PeerStatus {
                peer_id,
                status,
                timestamp,
            }] => {
                assert_eq!(peer_id, "a1");
                assert_eq!(status, "away");
                assert!(*timestamp > 0);
            }
            other => panic!("Unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_broadcasts_offline() {
        let server = RelayServer::new();
        let (a, _a_rx) = register(&server, "a1");
        let (_b, mut b_rx) = register(&server, "b1");

        server.disconnect(a);

        assert!(!server.is_registered("a1"));
        match drain(&mut b_rx).as_slice() {
            [ServerMessage::PeerStatus {
                peer_id, status, ..
            }] => {
                assert_eq!(peer_id, "a1");
                assert_eq!(status, STATUS_OFFLINE);
            }
            other => panic!("Unexpected frames: {:?}", other),
        }
        assert_eq!(server.get_stats().connections_active, 1);
    }

    #[test]
    fn test_offline_reaches_unregistered_sockets() {
        let server = RelayServer::new();
        let (a, _a_rx) = register(&server, "a1");
        let (_anon, mut anon_rx) = server.connect().unwrap();

        server.disconnect(a);

        match drain(&mut anon_rx).as_slice() {
            [ServerMessage::PeerStatus {
                peer_id, status, ..
            }] => {
                assert_eq!(peer_id, "a1");
                assert_eq!(status, STATUS_OFFLINE);
            }
            other => panic!("Unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_keeps_socket() {
        let server = RelayServer::new();
        let (conn, mut rx) = server.connect().unwrap();

        server.handle_text(conn, "{not json");
        match drain(&mut rx).as_slice() {
            [ServerMessage::Error { message, .. }] => assert!(message.starts_with("invalid message")),
            other => panic!("Unexpected frames: {:?}", other),
        }

        server.handle_text(conn, r#"{"type":"ping"}"#);
        assert_eq!(drain(&mut rx), vec![ServerMessage::Pong]);
        assert_eq!(server.get_stats().frames_malformed, 1);
    }
}
