//! In-process transport backend
//!
//! `MemoryNetwork` connects any number of `MemoryBackend`s living in the
//! same process. Channels are pairs of unbounded queues; both ends see
//! `Open` immediately. Used by the integration tests and for embedding.

use super::abstraction::{BackendEvent, ChannelEvent, ChannelHandle, ChannelSink, TransportBackend};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<BackendEvent>>,
    unresponsive: HashSet<String>,
    stalled: HashSet<String>,
    // Keeps never-answering channels alive so their receivers stay pending
    parked: Vec<mpsc::UnboundedSender<ChannelEvent>>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend attached to this network
    pub fn backend(&self) -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend {
            network: self.clone(),
            state: RwLock::new(BackendState::Uninitialized),
            local_peer_id: RwLock::new(None),
            events_tx: Mutex::new(None),
            initialize_count: AtomicUsize::new(0),
        })
    }

    /// Channels opened to `peer_id` never open nor fail
    pub fn set_unresponsive(&self, peer_id: &str) {
        self.inner.lock().unresponsive.insert(peer_id.to_string());
    }

    /// `open_channel` to `peer_id` never returns
    pub fn set_stalled(&self, peer_id: &str) {
        self.inner.lock().stalled.insert(peer_id.to_string());
    }

    pub fn is_attached(&self, peer_id: &str) -> bool {
        self.inner.lock().endpoints.contains_key(peer_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Ready,
    Destroyed,
}

pub struct MemoryBackend {
    network: MemoryNetwork,
    state: RwLock<BackendState>,
    local_peer_id: RwLock<Option<String>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
    initialize_count: AtomicUsize,
}

impl MemoryBackend {
    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    /// Number of successful `initialize` calls
    pub fn initialize_count(&self) -> usize {
        self.initialize_count.load(Ordering::SeqCst)
    }

    /// Push a backend-level error to the manager
    pub fn emit_error(&self, message: &str, fatal: bool) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(BackendEvent::Error {
                message: message.to_string(),
                fatal,
            });
        }
    }

    /// Tear the instance down and report a fatal server-level error
    pub fn simulate_server_failure(&self) {
        let tx = self.events_tx.lock().take();
        self.detach();
        *self.state.write() = BackendState::Destroyed;
        if let Some(tx) = tx {
            let _ = tx.send(BackendEvent::Error {
                message: "server connection lost".to_string(),
                fatal: true,
            });
        }
    }

    fn detach(&self) {
        if let Some(local) = self.local_peer_id.read().as_deref() {
            let mut net = self.network.inner.lock();
            let ours = self
                .events_tx
                .lock()
                .as_ref()
                .zip(net.endpoints.get(local))
                .map_or(true, |(mine, registered)| mine.same_channel(registered));
            if ours {
                net.endpoints.remove(local);
            }
        }
    }
}

#[async_trait]
impl TransportBackend for MemoryBackend {
    async fn initialize(
        &self,
        local_peer_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<BackendEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network
            .inner
            .lock()
            .endpoints
            .insert(local_peer_id.to_string(), tx.clone());
        *self.events_tx.lock() = Some(tx);
        *self.local_peer_id.write() = Some(local_peer_id.to_string());
        *self.state.write() = BackendState::Ready;
        self.initialize_count.fetch_add(1, Ordering::SeqCst);
        debug!(peer = %local_peer_id, "Memory backend initialized");
        Ok(rx)
    }

    fn is_destroyed(&self) -> bool {
        self.state() == BackendState::Destroyed
    }

    async fn open_channel(&self, remote_peer_id: &str) -> Result<ChannelHandle, TransportError> {
        match self.state() {
            BackendState::Ready => {}
            BackendState::Uninitialized => return Err(TransportError::NotInitialized),
            BackendState::Destroyed => return Err(TransportError::Destroyed),
        }
        let local = self
            .local_peer_id
            .read()
            .clone()
            .ok_or(TransportError::NotInitialized)?;

        let stalled = self.network.inner.lock().stalled.contains(remote_peer_id);
        if stalled {
            futures::future::pending::<()>().await;
        }

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let mut net = self.network.inner.lock();

        if net.unresponsive.contains(remote_peer_id) {
            net.parked.push(local_tx.clone());
            let sink = MemorySink::new(None, local_tx, Arc::new(AtomicBool::new(false)));
            return Ok(ChannelHandle {
                remote_peer_id: remote_peer_id.to_string(),
                sink: Arc::new(sink),
                events: local_rx,
            });
        }

        let Some(remote_backend) = net.endpoints.get(remote_peer_id).cloned() else {
            drop(net);
            let _ = local_tx.send(ChannelEvent::Error(format!(
                "peer {} unreachable",
                remote_peer_id
            )));
            let sink = MemorySink::new(None, local_tx, Arc::new(AtomicBool::new(false)));
            return Ok(ChannelHandle {
                remote_peer_id: remote_peer_id.to_string(),
                sink: Arc::new(sink),
                events: local_rx,
            });
        };
        drop(net);

        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let local_sink = MemorySink::new(Some(remote_tx.clone()), local_tx.clone(), open.clone());
        let remote_sink = MemorySink::new(Some(local_tx.clone()), remote_tx.clone(), open);

        let _ = local_tx.send(ChannelEvent::Open);
        let _ = remote_tx.send(ChannelEvent::Open);

        let incoming = ChannelHandle {
            remote_peer_id: local,
            sink: Arc::new(remote_sink),
            events: remote_rx,
        };
        if remote_backend
            .send(BackendEvent::IncomingChannel(incoming))
            .is_err()
        {
            return Err(TransportError::Channel(format!(
                "peer {} backend stopped",
                remote_peer_id
            )));
        }

        Ok(ChannelHandle {
            remote_peer_id: remote_peer_id.to_string(),
            sink: Arc::new(local_sink),
            events: local_rx,
        })
    }

    async fn destroy(&self) {
        self.detach();
        self.events_tx.lock().take();
        *self.state.write() = BackendState::Destroyed;
    }
}

/// One end of an in-memory channel
struct MemorySink {
    peer: Option<mpsc::UnboundedSender<ChannelEvent>>,
    own: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl MemorySink {
    fn new(
        peer: Option<mpsc::UnboundedSender<ChannelEvent>>,
        own: mpsc::UnboundedSender<ChannelEvent>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self { peer, own, open }
    }
}

impl ChannelSink for MemorySink {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        let peer = match &self.peer {
            Some(peer) if self.open.load(Ordering::SeqCst) => peer,
            _ => return Err(TransportError::NotOpen("memory channel".to_string())),
        };
        peer.send(ChannelEvent::Message(text.to_string()))
            .map_err(|_| TransportError::Channel("remote end dropped".to_string()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(peer) = &self.peer {
                let _ = peer.send(ChannelEvent::Closed);
            }
            let _ = self.own.send(ChannelEvent::Closed);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
