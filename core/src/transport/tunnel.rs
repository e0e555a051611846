//! Relay tunnel backend
//!
//! Carries data-channel frames as opaque `signal` payloads through the
//! coordination relay. Each channel is identified by a random id chosen by
//! its initiator:
//!
//! ```text
//! A                      relay                      B
//! |-- tunnel-open{ch} ---->|-- signal from A ------->|  B: IncomingChannel
//! |<---------------- tunnel-accept{ch} --------------|  A: Open
//! |<=============== tunnel-data{ch,text} ===========>|
//! |----------------- tunnel-close{ch} -------------->|  both: Closed
//! ```
//!
//! When the relay rejects a frame because B has no live socket, every
//! channel to B ends: pending opens report `Error`, open ones `Closed`.

use super::abstraction::{BackendEvent, ChannelEvent, ChannelHandle, ChannelSink, TransportBackend};
use crate::error::TransportError;
use crate::relay::client::SignalingClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tunnel control frame, sent as the relay `signal` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TunnelFrame {
    TunnelOpen { channel: String },
    TunnelAccept { channel: String },
    TunnelData { channel: String, text: String },
    TunnelClose { channel: String },
}

impl TunnelFrame {
    fn channel(&self) -> &str {
        match self {
            TunnelFrame::TunnelOpen { channel }
            | TunnelFrame::TunnelAccept { channel }
            | TunnelFrame::TunnelData { channel, .. }
            | TunnelFrame::TunnelClose { channel } => channel,
        }
    }
}

/// Outbound path for tunnel frames
pub trait SignalSender: Send + Sync {
    fn send_signal(&self, to: &str, signal: serde_json::Value) -> Result<(), TransportError>;
}

impl SignalSender for SignalingClient {
    fn send_signal(&self, to: &str, signal: serde_json::Value) -> Result<(), TransportError> {
        SignalingClient::send_signal(self, to, signal)
    }
}

struct TunnelChannel {
    remote_peer_id: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct TunnelState {
    local_peer_id: Option<String>,
    backend_events: Option<mpsc::UnboundedSender<BackendEvent>>,
    channels: HashMap<String, TunnelChannel>,
    destroyed: bool,
}

struct TunnelInner {
    signals: Arc<dyn SignalSender>,
    state: Mutex<TunnelState>,
}

impl TunnelInner {
    fn send_frame(&self, to: &str, frame: &TunnelFrame) -> Result<(), TransportError> {
        let value = serde_json::to_value(frame)
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        self.signals.send_signal(to, value)
    }

    fn remove_channel(&self, channel: &str) -> Option<TunnelChannel> {
        self.state.lock().channels.remove(channel)
    }
}

/// Transport backend that tunnels channels through the relay
#[derive(Clone)]
pub struct RelayTunnel {
    inner: Arc<TunnelInner>,
}

impl RelayTunnel {
    pub fn new(signals: Arc<dyn SignalSender>) -> Self {
        Self {
            inner: Arc::new(TunnelInner {
                signals,
                state: Mutex::new(TunnelState::default()),
            }),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    fn register_channel(
        &self,
        channel: &str,
        remote_peer_id: &str,
        open: bool,
    ) -> (mpsc::UnboundedSender<ChannelEvent>, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open_flag = Arc::new(AtomicBool::new(open));
        self.inner.state.lock().channels.insert(
            channel.to_string(),
            TunnelChannel {
                remote_peer_id: remote_peer_id.to_string(),
                events: tx.clone(),
                open: open_flag.clone(),
            },
        );
        let sink = TunnelSink {
            inner: self.inner.clone(),
            channel: channel.to_string(),
            remote_peer_id: remote_peer_id.to_string(),
            open: open_flag,
        };
        let handle = ChannelHandle {
            remote_peer_id: remote_peer_id.to_string(),
            sink: Arc::new(sink),
            events: rx,
        };
        (tx, handle)
    }
}

#[async_trait]
impl TransportBackend for RelayTunnel {
    async fn initialize(
        &self,
        local_peer_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<BackendEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        state.local_peer_id = Some(local_peer_id.to_string());
        state.backend_events = Some(tx);
        state.destroyed = false;
        info!(peer = %local_peer_id, "Relay tunnel initialized");
        Ok(rx)
    }

    fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    async fn open_channel(&self, remote_peer_id: &str) -> Result<ChannelHandle, TransportError> {
        {
            let state = self.inner.state.lock();
            if state.destroyed {
                return Err(TransportError::Destroyed);
            }
            if state.backend_events.is_none() {
                return Err(TransportError::NotInitialized);
            }
        }

        let channel = uuid::Uuid::new_v4().to_string();
        let (_, handle) = self.register_channel(&channel, remote_peer_id, false);

        if let Err(e) = self.inner.send_frame(
            remote_peer_id,
            &TunnelFrame::TunnelOpen {
                channel: channel.clone(),
            },
        ) {
            self.inner.remove_channel(&channel);
            return Err(e);
        }
        debug!(peer = %remote_peer_id, channel = %channel, "Tunnel channel requested");
        Ok(handle)
    }

    async fn destroy(&self) {
        let channels: Vec<TunnelChannel> = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            state.backend_events = None;
            state.channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
            let _ = channel.events.send(ChannelEvent::Closed);
        }
    }

    fn peer_unreachable(&self, peer_id: &str) {
        let dropped: Vec<TunnelChannel> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<String> = state
                .channels
                .iter()
                .filter(|(_, c)| c.remote_peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.channels.remove(id))
                .collect()
        };
        if dropped.is_empty() {
            return;
        }

        info!(peer = %peer_id, channels = dropped.len(), "Relay cannot reach peer");
        for channel in dropped {
            if channel.open.swap(false, Ordering::SeqCst) {
                let _ = channel.events.send(ChannelEvent::Closed);
            } else {
                let _ = channel
                    .events
                    .send(ChannelEvent::Error(format!("peer {} not available", peer_id)));
            }
        }
    }

    fn handle_signal(&self, from: &str, signal: &serde_json::Value) {
        let frame: TunnelFrame = match serde_json::from_value(signal.clone()) {
            Ok(frame) => frame,
            Err(_) => {
                debug!(peer = %from, "Ignoring non-tunnel signal");
                return;
            }
        };

        if let TunnelFrame::TunnelOpen { channel } = &frame {
            let backend_events = {
                let state = self.inner.state.lock();
                if state.destroyed {
                    return;
                }
                state.backend_events.clone()
            };
            let Some(backend_events) = backend_events else {
                return;
            };

            let (tx, handle) = self.register_channel(channel, from, true);
            if let Err(e) = self.inner.send_frame(
                from,
                &TunnelFrame::TunnelAccept {
                    channel: channel.clone(),
                },
            ) {
                warn!(peer = %from, "Failed to accept tunnel channel: {}", e);
                self.inner.remove_channel(channel);
                return;
            }
            let _ = tx.send(ChannelEvent::Open);
            let _ = backend_events.send(BackendEvent::IncomingChannel(handle));
            return;
        }

        let mut state = self.inner.state.lock();
        let known = state
            .channels
            .get(frame.channel())
            .is_some_and(|c| c.remote_peer_id == from);
        if !known {
            debug!(peer = %from, channel = %frame.channel(), "Frame for unknown tunnel channel");
            return;
        }

        match frame {
            TunnelFrame::TunnelAccept { channel } => {
                if let Some(entry) = state.channels.get(&channel) {
                    entry.open.store(true, Ordering::SeqCst);
                    let _ = entry.events.send(ChannelEvent::Open);
                }
            }
            TunnelFrame::TunnelData { channel, text } => {
                if let Some(entry) = state.channels.get(&channel) {
                    let _ = entry.events.send(ChannelEvent::Message(text));
                }
            }
            TunnelFrame::TunnelClose { channel } => {
                if let Some(entry) = state.channels.remove(&channel) {
                    entry.open.store(false, Ordering::SeqCst);
                    let _ = entry.events.send(ChannelEvent::Closed);
                }
            }
            TunnelFrame::TunnelOpen { .. } => {}
        }
    }
}

struct TunnelSink {
    inner: Arc<TunnelInner>,
    channel: String,
    remote_peer_id: String,
    open: Arc<AtomicBool>,
}

impl ChannelSink for TunnelSink {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen(self.remote_peer_id.clone()));
        }
        self.inner.send_frame(
            &self.remote_peer_id,
            &TunnelFrame::TunnelData {
                channel: self.channel.clone(),
                text: text.to_string(),
            },
        )
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let Some(entry) = self.inner.remove_channel(&self.channel) else {
            return;
        };
        let _ = self.inner.send_frame(
            &self.remote_peer_id,
            &TunnelFrame::TunnelClose {
                channel: self.channel.clone(),
            },
        );
        let _ = entry.events.send(ChannelEvent::Closed);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
