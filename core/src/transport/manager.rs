//! Peer Manager — owns the transport backend and every per-peer channel
//!
//! One `ConnectionRecord` per remote peer id, created on first use and kept
//! for the life of the manager. Each channel gets a driver task that feeds
//! its lifecycle events into the state machine and its frames into the
//! multiplexer, so per-peer frame order is transport order.
//!
//! Locks are never held across `.await`. Concurrent `connect_to_peer` calls
//! for the same peer are made idempotent by reserving the record (state
//! `Connecting`) under the lock before the backend is asked for a channel.

use crate::error::{PeerLinkError, ResourceExhaustion, TransportError};
use crate::handshake::{ContactHandshake, HandshakeOutcome};
use crate::identity::{IdentityProvider, PeerIdentity};
use crate::message::codec::encode_envelope;
use crate::message::mux::Multiplexer;
use crate::message::types::{DataEnvelope, FileFrame, Payload};
use crate::relay::client::{SignalingClient, SignalingEvent};
use crate::relay::protocol::ServerMessage;
use crate::store::{
    ChatMessage, Contact, ContactStore, DeliveryStatus, LogNotifier, MemoryContactStore,
    MemoryMessageStore, MessageKind, MessageStore, Notifier, Presence,
};
use crate::time::current_timestamp_ms;
use crate::transfer::{
    ChunkOutcome, FileReassembler, FileSender, OutgoingFile, ReceivedFile, CHUNK_SIZE,
};
use crate::transport::abstraction::{
    BackendEvent, ChannelEvent, ChannelHandle, ChannelSink, TransportBackend,
};
use crate::transport::state::{ConnectionLifecycle, ConnectionState};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Peer manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// `register_peer` calls within this window of the last initialization
    /// are no-ops
    pub init_cooldown: Duration,
    /// Delay before re-initializing after a fatal backend error
    pub reinit_delay: Duration,
    /// Upper bound on waiting for a channel to open
    pub connect_timeout: Duration,
    pub chunk_size: usize,
    /// Lifetime of an incomplete inbound transfer
    pub transfer_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            init_cooldown: Duration::from_millis(3000),
            reinit_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            chunk_size: CHUNK_SIZE,
            transfer_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// External collaborators injected into the manager
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub contacts: Arc<dyn ContactStore>,
    pub messages: Arc<dyn MessageStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// In-memory stores and a log-only notifier
    pub fn in_memory(identity: PeerIdentity) -> Self {
        Self {
            identity: Arc::new(identity),
            contacts: Arc::new(MemoryContactStore::new()),
            messages: Arc::new(MemoryMessageStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Initialized,
    /// Last initialization is younger than the cooldown
    CoolingDown,
    /// Another initialization is already running
    InFlight,
}

/// Everything the manager reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    ChatReceived(ChatMessage),
    FileReceived(ReceivedFile),
    TransferExpired(ResourceExhaustion),
    Typing {
        peer_id: String,
        is_typing: bool,
    },
    ReadReceipt {
        peer_id: String,
        message_ids: Vec<String>,
    },
    /// call-offer / call-answer / call-end received on a data channel
    CallSignal {
        peer_id: String,
        payload: Payload,
    },
    /// offer / answer / ice-candidate relayed by the coordination relay
    RelaySignal(ServerMessage),
    ContactAdded(Contact),
    PeerStatus {
        peer_id: String,
        presence: Presence,
    },
    /// The signaling socket gave up reconnecting
    SignalingLost,
}

struct ConnectionRecord {
    lifecycle: ConnectionLifecycle,
    /// Bumped whenever a new channel replaces the old one; events from
    /// older channels are ignored
    generation: u64,
    sink: Option<Arc<dyn ChannelSink>>,
    /// Simultaneous incoming channel we outranked. Left open so the remote
    /// side only sees it close once it adopts our channel instead.
    parked: Option<Arc<dyn ChannelSink>>,
    outbound: bool,
    introduced: bool,
    ready: watch::Sender<ConnectionState>,
}

impl ConnectionRecord {
    fn new(peer_id: &str) -> Self {
        let (ready, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            lifecycle: ConnectionLifecycle::new(peer_id),
            generation: 0,
            sink: None,
            parked: None,
            outbound: false,
            introduced: false,
            ready,
        }
    }

    fn is_open(&self) -> bool {
        self.lifecycle.state() == ConnectionState::Connected
            && self.sink.as_ref().is_some_and(|sink| sink.is_open())
    }

    /// Apply a transition; returns whether the state changed
    fn step(&mut self, next: ConnectionState) -> bool {
        match self.lifecycle.transition(next) {
            Ok(Some(_)) => {
                self.ready.send_replace(next);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn close_sink(&mut self) {
        for sink in [self.sink.take(), self.parked.take()].into_iter().flatten() {
            sink.close();
        }
    }
}

#[derive(Default)]
struct InitState {
    last_initialized: Option<Instant>,
    in_flight: bool,
}

struct Shared {
    config: ManagerConfig,
    collab: Collaborators,
    backend: Arc<dyn TransportBackend>,
    mux: Multiplexer,
    reassembler: FileReassembler,
    handshake: ContactHandshake,
    connections: Mutex<HashMap<String, ConnectionRecord>>,
    next_generation: AtomicU64,
    init: Mutex<InitState>,
    reinit_scheduled: AtomicBool,
    events: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    status_observers: Mutex<HashMap<String, mpsc::UnboundedSender<ConnectionState>>>,
    signaling: Mutex<Option<SignalingClient>>,
    backend_task: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(task) = self.backend_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

/// Handle to the peer manager. Cheap to clone.
#[derive(Clone)]
pub struct PeerManager {
    shared: Arc<Shared>,
}

impl PeerManager {
    pub fn new(
        config: ManagerConfig,
        collab: Collaborators,
        backend: Arc<dyn TransportBackend>,
    ) -> Self {
        let handshake = ContactHandshake::new(
            collab.identity.clone(),
            collab.contacts.clone(),
            collab.notifier.clone(),
        );
        let reassembler = FileReassembler::new(config.transfer_ttl);
        Self {
            shared: Arc::new(Shared {
                config,
                collab,
                backend,
                mux: Multiplexer::new(),
                reassembler,
                handshake,
                connections: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                init: Mutex::new(InitState::default()),
                reinit_scheduled: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
                status_observers: Mutex::new(HashMap::new()),
                signaling: Mutex::new(None),
                backend_task: Mutex::new(None),
                sweeper: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_peer_id(&self) -> String {
        self.shared.collab.identity.peer_id()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.shared.mux
    }

    pub fn contacts(&self) -> &Arc<dyn ContactStore> {
        &self.shared.collab.contacts
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.shared.collab.messages
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Bind the backend to the local identity. Idempotent: skipped while a
    /// previous initialization is in flight or younger than the cooldown.
    pub async fn register_peer(&self) -> Result<RegisterOutcome, PeerLinkError> {
        self.initialize(false).await
    }

    async fn initialize(&self, force: bool) -> Result<RegisterOutcome, PeerLinkError> {
        {
            let mut init = self.shared.init.lock();
            if init.in_flight {
                debug!("Backend initialization already in flight");
                return Ok(RegisterOutcome::InFlight);
            }
            if !force {
                if let Some(last) = init.last_initialized {
                    if last.elapsed() < self.shared.config.init_cooldown {
                        debug!("Backend initialized {:?} ago, skipping", last.elapsed());
                        return Ok(RegisterOutcome::CoolingDown);
                    }
                }
            }
            init.in_flight = true;
        }

        let result = self.initialize_backend().await;

        let mut init = self.shared.init.lock();
        init.in_flight = false;
        if result.is_ok() {
            init.last_initialized = Some(Instant::now());
        }
        result.map(|()| RegisterOutcome::Initialized)
    }

    async fn initialize_backend(&self) -> Result<(), PeerLinkError> {
        let peer_id = self.local_peer_id();

        // Channels belong to the instance being replaced
        self.close_all_channels();
        let previous = self.shared.backend_task.lock().take();
        if let Some(task) = previous {
            task.abort();
            self.shared.backend.destroy().await;
        }

        let events = self.shared.backend.initialize(&peer_id).await?;
        let task = tokio::spawn(run_backend_events(Arc::downgrade(&self.shared), events));
        *self.shared.backend_task.lock() = Some(task);

        self.ensure_sweeper();
        info!(peer = %peer_id, "Transport backend initialized");
        Ok(())
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.shared.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                PeerManager { shared }.sweep_expired_transfers();
            }
        }));
    }

    fn on_backend_error(&self, message: &str, fatal: bool) {
        if !fatal || !self.shared.backend.is_destroyed() {
            warn!("Transport backend error: {}", message);
            return;
        }
        if self.shared.reinit_scheduled.swap(true, Ordering::SeqCst) {
            debug!("Re-initialization already scheduled");
            return;
        }

        let delay = self.shared.config.reinit_delay;
        error!("Transport backend lost ({}), re-initializing in {:?}", message, delay);

        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            let manager = PeerManager { shared };
            manager.shared.reinit_scheduled.store(false, Ordering::SeqCst);
            match manager.initialize(true).await {
                Ok(outcome) => info!(?outcome, "Backend re-initialization finished"),
                Err(e) => error!("Backend re-initialization failed: {}", e),
            }
        });
        self.shared.tasks.lock().push(task);
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    /// Open a channel to `peer_id` and wait until it is ready. Resolves at
    /// once if a channel is already open and joins an attempt in flight.
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<(), PeerLinkError> {
        if peer_id == self.local_peer_id() {
            return Err(TransportError::Channel("cannot connect to self".to_string()).into());
        }

        enum Plan {
            Ready,
            Join(u64),
            Open(u64),
        }

        // Opening the channel and waiting for it share one deadline
        let deadline = Instant::now() + self.shared.config.connect_timeout;

        let mut changes = Vec::new();
        let (plan, mut ready) = {
            let mut conns = self.shared.connections.lock();
            let record = conns
                .entry(peer_id.to_string())
                .or_insert_with(|| ConnectionRecord::new(peer_id));
            let ready = record.ready.subscribe();

            let plan = if record.is_open() {
                Plan::Ready
            } else if record.lifecycle.state() == ConnectionState::Connecting {
                Plan::Join(record.generation)
            } else {
                // A Connected record with a dead channel is stale
                if record.lifecycle.state() == ConnectionState::Connected
                    && record.step(ConnectionState::Disconnected)
                {
                    changes.push(ConnectionState::Disconnected);
                }
                record.close_sink();
                record.generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
                record.outbound = true;
                record.introduced = false;
                if record.step(ConnectionState::Connecting) {
                    changes.push(ConnectionState::Connecting);
                }
                Plan::Open(record.generation)
            };
            (plan, ready)
        };
        for state in changes {
            self.on_state_changed(peer_id, state);
        }

        let generation = match plan {
            Plan::Ready => return Ok(()),
            Plan::Join(generation) => {
                debug!(peer = %peer_id, "Joining in-flight connection attempt");
                generation
            }
            Plan::Open(generation) => {
                let open = self.shared.backend.open_channel(peer_id);
                match tokio::time::timeout_at(deadline, open).await {
                    Ok(Ok(handle)) => self.attach_channel(handle, generation),
                    Ok(Err(e)) => {
                        warn!(peer = %peer_id, "Failed to open channel: {}", e);
                        self.fail_channel(peer_id, generation);
                        return Err(e.into());
                    }
                    Err(_) => return Err(self.connect_timed_out(peer_id, generation)),
                }
                generation
            }
        };

        self.wait_until_open(peer_id, generation, &mut ready, deadline)
            .await
    }

    async fn wait_until_open(
        &self,
        peer_id: &str,
        generation: u64,
        ready: &mut watch::Receiver<ConnectionState>,
        deadline: Instant,
    ) -> Result<(), PeerLinkError> {
        let wait = async {
            loop {
                let state = *ready.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(TransportError::Channel(format!(
                            "connection to {} failed",
                            peer_id
                        )))
                    }
                    ConnectionState::Disconnected => {
                        return Err(TransportError::NotOpen(peer_id.to_string()))
                    }
                    ConnectionState::Connecting => {}
                }
                if ready.changed().await.is_err() {
                    return Err(TransportError::NotOpen(peer_id.to_string()));
                }
            }
        };

        match tokio::time::timeout_at(deadline, wait).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(self.connect_timed_out(peer_id, generation)),
        }
    }

    /// The attempt outlived its deadline: move it to `Failed`
    fn connect_timed_out(&self, peer_id: &str, generation: u64) -> PeerLinkError {
        let timeout = self.shared.config.connect_timeout;
        warn!(peer = %peer_id, ?timeout, "Connection attempt timed out");
        self.fail_channel(peer_id, generation);
        TransportError::Timeout {
            peer: peer_id.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .into()
    }

    /// Whether a channel to `peer_id` is open and ready, connecting first
    /// if needed. Never fails; returns `false` instead.
    pub async fn ensure_connection(&self, peer_id: &str) -> bool {
        if self.is_connected(peer_id) {
            return true;
        }
        match self.connect_to_peer(peer_id).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer_id, "ensure_connection failed: {}", e);
                false
            }
        }
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.shared
            .connections
            .lock()
            .get(peer_id)
            .is_some_and(ConnectionRecord::is_open)
    }

    pub fn connection_state(&self, peer_id: &str) -> ConnectionState {
        self.shared
            .connections
            .lock()
            .get(peer_id)
            .map_or(ConnectionState::Disconnected, |r| r.lifecycle.state())
    }

    /// Number of connection records (one per peer ever contacted)
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .shared
            .connections
            .lock()
            .iter()
            .filter(|(_, record)| record.is_open())
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Close the channel to `peer_id`
    pub fn disconnect(&self, peer_id: &str) {
        let changed = {
            let mut conns = self.shared.connections.lock();
            match conns.get_mut(peer_id) {
                Some(record) => {
                    record.close_sink();
                    record.step(ConnectionState::Disconnected)
                }
                None => false,
            }
        };
        if changed {
            info!(peer = %peer_id, "Disconnected");
            self.on_state_changed(peer_id, ConnectionState::Disconnected);
        }
    }

    /// Close every channel, stop background tasks and destroy the backend
    pub async fn shutdown(&self) {
        self.close_all_channels();
        if let Some(client) = self.shared.signaling.lock().take() {
            client.close();
        }
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.shared.sweeper.lock().take() {
            task.abort();
        }
        let backend_task = self.shared.backend_task.lock().take();
        if let Some(task) = backend_task {
            task.abort();
        }
        self.shared.backend.destroy().await;
        info!("Peer manager shut down");
    }

    fn close_all_channels(&self) {
        let changed: Vec<String> = {
            let mut conns = self.shared.connections.lock();
            conns
                .iter_mut()
                .filter_map(|(peer_id, record)| {
                    record.close_sink();
                    let moved = if record.lifecycle.state() == ConnectionState::Connecting {
                        record.step(ConnectionState::Failed)
                    } else {
                        record.step(ConnectionState::Disconnected)
                    };
                    moved.then(|| peer_id.clone())
                })
                .collect()
        };
        for peer_id in changed {
            let state = self.connection_state(&peer_id);
            self.on_state_changed(&peer_id, state);
        }
    }

    fn attach_channel(&self, handle: ChannelHandle, generation: u64) {
        let ChannelHandle {
            remote_peer_id,
            sink,
            events,
        } = handle;
        {
            let mut conns = self.shared.connections.lock();
            match conns.get_mut(&remote_peer_id) {
                Some(record) if record.generation == generation => {
                    record.sink = Some(sink);
                }
                _ => {
                    debug!(peer = %remote_peer_id, "Channel superseded before attach");
                    sink.close();
                    return;
                }
            }
        }
        tokio::spawn(drive_channel(
            Arc::downgrade(&self.shared),
            remote_peer_id,
            generation,
            events,
        ));
    }

    /// Track a remote-initiated channel. When both sides opened a channel at
    /// the same time, the one initiated by the smaller peer id survives: the
    /// smaller side parks the other channel, the larger side adopts and
    /// closes its own.
    fn adopt_incoming(&self, handle: ChannelHandle) {
        let ChannelHandle {
            remote_peer_id: peer_id,
            sink,
            events,
        } = handle;
        let local = self.local_peer_id();

        let mut changes = Vec::new();
        let generation = {
            let mut conns = self.shared.connections.lock();
            let record = conns
                .entry(peer_id.clone())
                .or_insert_with(|| ConnectionRecord::new(&peer_id));

            let live = record.lifecycle.state() == ConnectionState::Connecting || record.is_open();
            if live && record.outbound && local < peer_id {
                debug!(peer = %peer_id, "Keeping own channel over simultaneous incoming one");
                if let Some(previous) = record.parked.replace(sink) {
                    previous.close();
                }
                return;
            }

            record.close_sink();
            if record.lifecycle.state() == ConnectionState::Connected
                && record.step(ConnectionState::Disconnected)
            {
                changes.push(ConnectionState::Disconnected);
            }
            record.generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
            record.outbound = false;
            record.introduced = false;
            record.sink = Some(sink);
            if record.step(ConnectionState::Connecting) {
                changes.push(ConnectionState::Connecting);
            }
            record.generation
        };
        for state in changes {
            self.on_state_changed(&peer_id, state);
        }

        info!(peer = %peer_id, "Accepted incoming channel");
        tokio::spawn(drive_channel(
            Arc::downgrade(&self.shared),
            peer_id,
            generation,
            events,
        ));
    }

    fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.shared
            .connections
            .lock()
            .get(peer_id)
            .is_some_and(|r| r.generation == generation)
    }

    fn on_channel_open(&self, peer_id: &str, generation: u64) {
        let (changed, intro_sink) = {
            let mut conns = self.shared.connections.lock();
            let Some(record) = conns.get_mut(peer_id) else { return };
            if record.generation != generation {
                return;
            }
            let changed = record.step(ConnectionState::Connected);
            let intro = if changed && record.outbound && !record.introduced {
                record.introduced = true;
                record.sink.clone()
            } else {
                None
            };
            (changed, intro)
        };

        if let Some(sink) = intro_sink {
            let envelope = DataEnvelope::new(self.shared.handshake.introduction());
            match encode_envelope(&envelope) {
                Ok(text) => {
                    if let Err(e) = sink.send(&text) {
                        warn!(peer = %peer_id, "Failed to send introduction: {}", e);
                    }
                }
                Err(e) => warn!("Failed to encode introduction: {}", e),
            }
        }
        if changed {
            info!(peer = %peer_id, "Channel open");
            self.on_state_changed(peer_id, ConnectionState::Connected);
        }
    }

    fn on_channel_closed(&self, peer_id: &str, generation: u64) {
        let changed = {
            let mut conns = self.shared.connections.lock();
            match conns.get_mut(peer_id) {
                Some(record) if record.generation == generation => {
                    record.sink = None;
                    if let Some(parked) = record.parked.take() {
                        parked.close();
                    }
                    record.step(ConnectionState::Disconnected)
                }
                _ => false,
            }
        };
        if changed {
            info!(peer = %peer_id, "Channel closed");
            self.on_state_changed(peer_id, ConnectionState::Disconnected);
        }
    }

    fn fail_channel(&self, peer_id: &str, generation: u64) {
        let changed = {
            let mut conns = self.shared.connections.lock();
            match conns.get_mut(peer_id) {
                Some(record) if record.generation == generation => {
                    record.close_sink();
                    record.step(ConnectionState::Failed)
                }
                _ => false,
            }
        };
        if changed {
            self.on_state_changed(peer_id, ConnectionState::Failed);
        }
    }

    fn on_state_changed(&self, peer_id: &str, state: ConnectionState) {
        debug!(peer = %peer_id, %state, "Connection state changed");

        if let Some(tx) = self.shared.status_observers.lock().get(peer_id) {
            let _ = tx.send(state);
        }

        let contacts = &self.shared.collab.contacts;
        match contacts.get_by_peer_id(peer_id) {
            Ok(Some(mut contact)) => {
                contact.presence = Presence::from(state);
                if state == ConnectionState::Connected {
                    contact.last_seen = Some(current_timestamp_ms());
                }
                if let Err(e) = contacts.upsert(contact) {
                    warn!(peer = %peer_id, "Failed to update presence: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(peer = %peer_id, "Contact lookup failed: {}", e),
        }

        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    fn on_frame(&self, peer_id: &str, raw: &str) {
        let Some(inbound) = self.shared.mux.dispatch(peer_id, raw) else {
            return;
        };
        let envelope = inbound.envelope;
        trace!(peer = %peer_id, kind = envelope.message_type(), "Inbound frame");

        match envelope.payload {
            Payload::Chat { content } => {
                let message = ChatMessage::incoming(
                    envelope.message_id,
                    peer_id,
                    content,
                    MessageKind::Text,
                    envelope.timestamp,
                );
                if let Err(e) = self.shared.collab.messages.append(message.clone()) {
                    warn!(peer = %peer_id, "Failed to store message: {}", e);
                }
                self.emit(PeerEvent::ChatReceived(message));
            }
            Payload::File(FileFrame::Metadata(metadata)) => {
                match self.shared.reassembler.begin(
                    peer_id,
                    &envelope.message_id,
                    metadata,
                    Instant::now(),
                ) {
                    Ok(Some(file)) => self.on_file_received(file),
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer_id, "Rejecting file transfer: {}", e),
                }
            }
            Payload::File(FileFrame::Chunk(chunk)) => {
                match self.shared.reassembler.accept_chunk(peer_id, chunk) {
                    Ok(ChunkOutcome::Complete(file)) => self.on_file_received(file),
                    Ok(ChunkOutcome::UnknownTransfer) => {
                        debug!(peer = %peer_id, "Discarding chunk for unknown transfer")
                    }
                    Ok(ChunkOutcome::Duplicate) => trace!(peer = %peer_id, "Duplicate chunk"),
                    Ok(ChunkOutcome::Stored { .. }) => {}
                    Err(e) => warn!(peer = %peer_id, "Dropping chunk: {}", e),
                }
            }
            Payload::Typing { is_typing } => self.emit(PeerEvent::Typing {
                peer_id: peer_id.to_string(),
                is_typing,
            }),
            Payload::ReadReceipt { message_ids } => self.emit(PeerEvent::ReadReceipt {
                peer_id: peer_id.to_string(),
                message_ids,
            }),
            Payload::ContactInfo(info) => match self.shared.handshake.handle(peer_id, &info) {
                Ok(HandshakeOutcome::Added(contact)) => self.emit(PeerEvent::ContactAdded(contact)),
                Ok(HandshakeOutcome::AlreadyKnown) => {}
                Err(e) => debug!(peer = %peer_id, "Ignoring contact-info: {}", e),
            },
            payload @ (Payload::CallOffer { .. }
            | Payload::CallAnswer { .. }
            | Payload::CallEnd { .. }) => self.emit(PeerEvent::CallSignal {
                peer_id: peer_id.to_string(),
                payload,
            }),
        }
    }

    fn on_file_received(&self, file: ReceivedFile) {
        let message = ChatMessage::incoming(
            file.file_id.clone(),
            &file.peer_id,
            file.name.clone(),
            MessageKind::File,
            current_timestamp_ms(),
        );
        if let Err(e) = self.shared.collab.messages.append(message) {
            warn!(peer = %file.peer_id, "Failed to store file record: {}", e);
        }
        self.emit(PeerEvent::FileReceived(file));
    }

    /// Evict incomplete transfers older than the TTL. Returns how many.
    pub fn sweep_expired_transfers(&self) -> usize {
        let expired = self.shared.reassembler.sweep_expired(Instant::now());
        let count = expired.len();
        for eviction in expired {
            warn!("{}", eviction);
            self.emit(PeerEvent::TransferExpired(eviction));
        }
        count
    }

    /// Incomplete inbound transfers
    pub fn active_transfers(&self) -> usize {
        self.shared.reassembler.session_count()
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    fn open_sink(&self, peer_id: &str) -> Result<Arc<dyn ChannelSink>, TransportError> {
        self.shared
            .connections
            .lock()
            .get(peer_id)
            .filter(|record| record.is_open())
            .and_then(|record| record.sink.clone())
            .ok_or_else(|| TransportError::NotOpen(peer_id.to_string()))
    }

    /// Encode and write one envelope
    pub fn send_envelope(&self, peer_id: &str, envelope: &DataEnvelope) -> Result<(), PeerLinkError> {
        let sink = self.open_sink(peer_id)?;
        let text = encode_envelope(envelope)?;
        sink.send(&text)?;
        Ok(())
    }

    /// Send any payload; `false` when there is no open channel or the write
    /// fails
    pub fn send(&self, peer_id: &str, payload: Payload) -> bool {
        let envelope = DataEnvelope::new(payload);
        match self.send_envelope(peer_id, &envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer_id, kind = envelope.message_type(), "Send failed: {}", e);
                false
            }
        }
    }

    /// Send a chat message and record it in the message store
    pub fn send_message(&self, peer_id: &str, text: &str) -> bool {
        let envelope = DataEnvelope::new(Payload::Chat {
            content: text.to_string(),
        });
        self.record_outgoing(ChatMessage::outgoing(
            envelope.message_id.clone(),
            peer_id,
            text.to_string(),
            MessageKind::Text,
        ));

        let sent = match self.send_envelope(peer_id, &envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %peer_id, "Message not sent: {}", e);
                false
            }
        };
        self.mark_delivery(&envelope.message_id, sent);
        sent
    }

    /// Send a file as metadata plus chunks and record it
    pub fn send_file(&self, peer_id: &str, file: &OutgoingFile) -> bool {
        let sender = FileSender::new(file, self.shared.config.chunk_size);
        self.record_outgoing(ChatMessage::outgoing(
            sender.file_id().to_string(),
            peer_id,
            file.name.clone(),
            MessageKind::File,
        ));

        let sent = match self.open_sink(peer_id) {
            Ok(sink) => match sender.send(sink.as_ref()) {
                Ok(()) => {
                    info!(
                        peer = %peer_id,
                        name = %file.name,
                        chunks = sender.chunk_count(),
                        "File sent"
                    );
                    true
                }
                Err(e) => {
                    warn!(peer = %peer_id, name = %file.name, "File transfer aborted: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!(peer = %peer_id, "File not sent: {}", e);
                false
            }
        };
        self.mark_delivery(sender.file_id(), sent);
        sent
    }

    pub fn send_typing(&self, peer_id: &str, is_typing: bool) -> bool {
        self.send(peer_id, Payload::Typing { is_typing })
    }

    pub fn send_read_receipt(&self, peer_id: &str, message_ids: Vec<String>) -> bool {
        self.send(peer_id, Payload::ReadReceipt { message_ids })
    }

    pub fn send_call_offer(&self, peer_id: &str, call_type: &str, sdp: Value) -> bool {
        self.send(
            peer_id,
            Payload::CallOffer {
                call_type: call_type.to_string(),
                sdp,
            },
        )
    }

    pub fn send_call_answer(&self, peer_id: &str, sdp: Value) -> bool {
        self.send(peer_id, Payload::CallAnswer { sdp })
    }

    pub fn send_call_end(&self, peer_id: &str, reason: Option<String>) -> bool {
        self.send(peer_id, Payload::CallEnd { reason })
    }

    fn record_outgoing(&self, message: ChatMessage) {
        if let Err(e) = self.shared.collab.messages.append(message) {
            warn!("Failed to record outgoing message: {}", e);
        }
    }

    fn mark_delivery(&self, message_id: &str, sent: bool) {
        let status = if sent {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        if let Err(e) = self.shared.collab.messages.update_status(message_id, status) {
            warn!(message_id = %message_id, "Failed to update delivery status: {}", e);
        }
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Receive every `PeerEvent`
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.events.lock().push(tx);
        rx
    }

    /// Observe one peer's connection state. The latest observer wins.
    pub fn subscribe_status(&self, peer_id: &str) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .status_observers
            .lock()
            .insert(peer_id.to_string(), tx);
        rx
    }

    /// Observe contacts added by the first-contact handshake
    pub fn subscribe_contacts_changed(&self) -> mpsc::UnboundedReceiver<Contact> {
        self.shared.handshake.subscribe_contacts_changed()
    }

    fn emit(&self, event: PeerEvent) {
        self.shared
            .events
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    /// Consume events from the signaling client: presence updates, relayed
    /// signals for the backend, call signaling for the application.
    pub fn attach_signaling(
        &self,
        client: SignalingClient,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        *self.shared.signaling.lock() = Some(client);
        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                PeerManager { shared }.on_signaling_event(event);
            }
        });
        self.shared.tasks.lock().push(task);
    }

    /// Broadcast our presence status through the relay
    pub fn publish_status(&self, status: &str) -> bool {
        let client = self.shared.signaling.lock().clone();
        match client {
            Some(client) => match client.update_status(status) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Status not published: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    fn on_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => info!("Signaling connected"),
            SignalingEvent::Disconnected => warn!("Signaling disconnected"),
            SignalingEvent::Reconnecting { attempt, delay } => {
                info!(attempt, ?delay, "Signaling reconnecting")
            }
            SignalingEvent::PermanentlyDisconnected => {
                error!("Signaling permanently disconnected");
                self.emit(PeerEvent::SignalingLost);
            }
            SignalingEvent::Message(message) => self.on_relay_message(message),
        }
    }

    fn on_relay_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::PeerStatus {
                peer_id, status, ..
            } => {
                let presence = Presence::from_status(&status);
                let contacts = &self.shared.collab.contacts;
                if let Ok(Some(contact)) = contacts.get_by_peer_id(&peer_id) {
                    if let Err(e) = contacts.upsert(contact.with_presence(presence)) {
                        warn!(peer = %peer_id, "Failed to update presence: {}", e);
                    }
                }
                self.emit(PeerEvent::PeerStatus { peer_id, presence });
            }
            ServerMessage::Signal { from, signal } => {
                self.shared.backend.handle_signal(&from, &signal);
            }
            ServerMessage::Registered { peer_id } => info!(peer = %peer_id, "Registered with relay"),
            ServerMessage::Pong => trace!("pong"),
            ServerMessage::Error { message, target } => {
                warn!(peer = ?target, "Relay error: {}", message);
                if let Some(peer_id) = target {
                    self.shared.backend.peer_unreachable(&peer_id);
                }
            }
            call @ (ServerMessage::Offer { .. }
            | ServerMessage::Answer { .. }
            | ServerMessage::IceCandidate { .. }) => self.emit(PeerEvent::RelaySignal(call)),
        }
    }
}

async fn run_backend_events(weak: Weak<Shared>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else { break };
        let manager = PeerManager { shared };
        match event {
            BackendEvent::IncomingChannel(handle) => manager.adopt_incoming(handle),
            BackendEvent::Error { message, fatal } => manager.on_backend_error(&message, fatal),
        }
    }
}

async fn drive_channel(
    weak: Weak<Shared>,
    peer_id: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else { return };
        let manager = PeerManager { shared };
        if !manager.is_current(&peer_id, generation) {
            debug!(peer = %peer_id, generation, "Dropping events of superseded channel");
            return;
        }
        match event {
            ChannelEvent::Open => manager.on_channel_open(&peer_id, generation),
            ChannelEvent::Message(text) => manager.on_frame(&peer_id, &text),
            ChannelEvent::Error(message) => {
                warn!(peer = %peer_id, "Channel error: {}", message);
                manager.fail_channel(&peer_id, generation);
                return;
            }
            ChannelEvent::Closed => {
                manager.on_channel_closed(&peer_id, generation);
                return;
            }
        }
    }

    if let Some(shared) = weak.upgrade() {
        PeerManager { shared }.on_channel_closed(&peer_id, generation);
    }
}
