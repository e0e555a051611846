//! Message Multiplexer — demultiplexes inbound channel frames
//!
//! Every decoded envelope goes to the per-peer subscriber for its sender (at
//! most one; the latest registration wins) and to every global subscriber.
//! Frames are dispatched in the order the caller hands them over, so a
//! caller that feeds one peer's frames sequentially keeps transport order.

use super::codec::decode_envelope;
use super::types::DataEnvelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An envelope tagged with the peer whose channel carried it
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub peer_id: String,
    pub envelope: DataEnvelope,
}

#[derive(Default)]
pub struct Multiplexer {
    per_peer: RwLock<HashMap<String, mpsc::UnboundedSender<InboundEnvelope>>>,
    global: RwLock<Vec<mpsc::UnboundedSender<InboundEnvelope>>>,
    dispatched: AtomicU64,
    parse_failures: AtomicU64,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one peer's envelopes. Replaces any earlier subscriber
    /// for the same peer.
    pub fn subscribe_peer(&self, peer_id: &str) -> mpsc::UnboundedReceiver<InboundEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.per_peer.write().insert(peer_id.to_string(), tx).is_some() {
            debug!(peer = %peer_id, "Replaced per-peer subscriber");
        }
        rx
    }

    pub fn unsubscribe_peer(&self, peer_id: &str) {
        self.per_peer.write().remove(peer_id);
    }

    /// Subscribe to envelopes from every peer
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<InboundEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.global.write().push(tx);
        rx
    }

    /// Decode `raw` and fan it out. Returns the envelope for further
    /// handling, or `None` when the frame does not parse.
    pub fn dispatch(&self, peer_id: &str, raw: &str) -> Option<InboundEnvelope> {
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer_id, "Dropping unparseable frame: {}", e);
                return None;
            }
        };

        let inbound = InboundEnvelope {
            peer_id: peer_id.to_string(),
            envelope,
        };

        {
            let mut per_peer = self.per_peer.write();
            if let Some(tx) = per_peer.get(peer_id) {
                if tx.send(inbound.clone()).is_err() {
                    per_peer.remove(peer_id);
                }
            }
        }

        self.global
            .write()
            .retain(|tx| tx.send(inbound.clone()).is_ok());

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Some(inbound)
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn parse_failure_count(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn global_subscriber_count(&self) -> usize {
        self.global.read().len()
    }
}
