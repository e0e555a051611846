//! Transport abstraction layer
//!
//! A backend establishes direct text channels to remote peers. The manager
//! never sees how; it gets a `ChannelHandle` per channel and drives the
//! lifecycle from the handle's event stream.

use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle and data events of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel is open and ready for data
    Open,
    /// Inbound text frame
    Message(String),
    /// Transport-level failure on this channel
    Error(String),
    /// Channel closed by either side
    Closed,
}

/// Write side of a channel
pub trait ChannelSink: Send + Sync {
    fn send(&self, text: &str) -> Result<(), TransportError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

/// One direct channel to a remote peer
pub struct ChannelHandle {
    pub remote_peer_id: String,
    pub sink: Arc<dyn ChannelSink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("remote_peer_id", &self.remote_peer_id)
            .field("open", &self.sink.is_open())
            .finish()
    }
}

/// Events from the backend as a whole
#[derive(Debug)]
pub enum BackendEvent {
    /// A remote peer opened a channel to us
    IncomingChannel(ChannelHandle),
    /// Backend-level error. `fatal` means the server side of the backend is
    /// gone and the instance must be re-initialized.
    Error { message: String, fatal: bool },
}

/// Connection-establishment backend bound to the local identity
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// (Re)bind to `local_peer_id`. Replaces any previous event stream.
    async fn initialize(
        &self,
        local_peer_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<BackendEvent>, TransportError>;

    fn is_destroyed(&self) -> bool;

    /// Start opening a channel. The handle's first event is `Open` or an
    /// error; the backend may also never answer.
    async fn open_channel(&self, remote_peer_id: &str) -> Result<ChannelHandle, TransportError>;

    async fn destroy(&self);

    /// Deliver an opaque signaling payload relayed from `from`
    fn handle_signal(&self, from: &str, signal: &serde_json::Value) {
        debug!(peer = %from, ?signal, "Backend ignores relayed signals");
    }

    /// The relay reported that `peer_id` has no live socket. Backends that
    /// open channels through the relay fail their pending opens to it.
    fn peer_unreachable(&self, peer_id: &str) {
        debug!(peer = %peer_id, "Relay reports peer unreachable");
    }
}
