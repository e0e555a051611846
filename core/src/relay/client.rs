//! Signaling client: the endpoint's persistent socket to the coordination relay
//!
//! Owns the websocket, registers the local identity on every (re)connect,
//! sends heartbeats, and reconnects on unexpected close with a linearly
//! growing delay. After the attempt budget is spent it gives up for good
//! and reports `SignalingEvent::PermanentlyDisconnected`.

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::TransportError;
use crate::identity::PeerIdentity;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay websocket URL, e.g. `ws://127.0.0.1:9000/ws`
    pub url: String,
    /// Reconnect attempts after an unexpected close before giving up
    pub max_reconnect_attempts: u32,
    /// Base delay; attempt `n` waits `n × base`
    pub reconnect_base_delay: Duration,
    /// Interval between `ping` frames while connected
    pub heartbeat_interval: Duration,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/ws".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Bounded, linearly growing reconnect schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based), or `None` once the budget
    /// is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay * attempt)
    }
}

impl From<&SignalingConfig> for ReconnectPolicy {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
        }
    }
}

/// Connection state of the signaling socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Connecting,
    Connected,
    Reconnecting,
    /// Closed on request
    Closed,
    /// Reconnect budget exhausted
    GaveUp,
}

/// Events surfaced to the owner of the client
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Message(ServerMessage),
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    PermanentlyDisconnected,
}

enum Outbound {
    Frame(ClientMessage),
    Close,
}

/// Handle to the signaling socket task. Cheap to clone.
#[derive(Clone)]
pub struct SignalingClient {
    identity: PeerIdentity,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Arc<RwLock<SignalingState>>,
}

impl SignalingClient {
    /// Spawn the socket task. Must be called from within a tokio runtime.
    pub fn spawn(
        config: SignalingConfig,
        identity: PeerIdentity,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(SignalingState::Connecting));

        tokio::spawn(run_socket(
            config,
            identity.clone(),
            outbound_rx,
            events_tx,
            Arc::clone(&state),
        ));

        (
            Self {
                identity,
                outbound: outbound_tx,
                state,
            },
            events_rx,
        )
    }

    /// Local identity this client registers as
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Queue a frame for the relay. Fails unless the socket is open.
    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        let state = self.state();
        if state != SignalingState::Connected {
            return Err(TransportError::Signaling(format!(
                "signaling socket is {:?}",
                state
            )));
        }
        self.outbound
            .send(Outbound::Frame(msg))
            .map_err(|_| TransportError::Signaling("signaling task stopped".to_string()))
    }

    /// Forward an opaque payload to another peer through the relay
    pub fn send_signal(&self, to: &str, signal: serde_json::Value) -> Result<(), TransportError> {
        self.send(ClientMessage::Signal {
            to: to.to_string(),
            from: Some(self.identity.id.clone()),
            signal,
        })
    }

    /// Broadcast a presence status to all other registered peers
    pub fn update_status(&self, status: &str) -> Result<(), TransportError> {
        self.send(ClientMessage::StatusUpdate {
            status: status.to_string(),
        })
    }

    pub fn state(&self) -> SignalingState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SignalingState::Connected
    }

    /// True once the reconnect budget is spent
    pub fn is_permanently_disconnected(&self) -> bool {
        self.state() == SignalingState::GaveUp
    }

    /// Close the socket and stop reconnecting
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn run_socket(
    config: SignalingConfig,
    identity: PeerIdentity,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: Arc<RwLock<SignalingState>>,
) {
    let policy = ReconnectPolicy::from(&config);
    let mut attempt = 0u32;

    loop {
        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((socket, _response)) => {
                attempt = 0;
                *state.write() = SignalingState::Connected;
                info!(url = %config.url, "Signaling socket connected");
                let _ = events.send(SignalingEvent::Connected);

                let (mut sink, mut stream) = socket.split();

                let register = ClientMessage::Register {
                    peer_id: identity.id.clone(),
                    display_name: identity.display_name.clone(),
                };
                let mut closed_by_owner = false;
                if let Err(e) = send_frame(&mut sink, &register).await {
                    warn!("Failed to send register frame: {}", e);
                } else {
                    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
                    heartbeat.tick().await;

                    loop {
                        tokio::select! {
                            cmd = outbound.recv() => match cmd {
                                Some(Outbound::Frame(msg)) => {
                                    if let Err(e) = send_frame(&mut sink, &msg).await {
                                        warn!("Signaling send failed: {}", e);
                                        break;
                                    }
                                }
                                Some(Outbound::Close) | None => {
                                    let _ = sink.send(Message::Close(None)).await;
                                    closed_by_owner = true;
                                    break;
                                }
                            },
                            frame = stream.next() => match frame {
                                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                                    Ok(msg) => {
                                        let _ = events.send(SignalingEvent::Message(msg));
                                    }
                                    Err(e) => debug!("Dropping malformed relay frame: {}", e),
                                },
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("Signaling socket error: {}", e);
                                    break;
                                }
                            },
                            _ = heartbeat.tick() => {
                                if let Err(e) = send_frame(&mut sink, &ClientMessage::Ping).await {
                                    warn!("Heartbeat failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }

                if closed_by_owner {
                    *state.write() = SignalingState::Closed;
                    info!("Signaling socket closed");
                    return;
                }
                warn!("Signaling socket closed unexpectedly");
                let _ = events.send(SignalingEvent::Disconnected);
            }
            Err(e) => {
                warn!(url = %config.url, "Signaling connect failed: {}", e);
            }
        }

        attempt += 1;
        let Some(delay) = policy.delay_for(attempt) else {
            *state.write() = SignalingState::GaveUp;
            error!(
                attempts = policy.max_attempts,
                "Giving up on signaling socket"
            );
            let _ = events.send(SignalingEvent::PermanentlyDisconnected);
            return;
        };

        *state.write() = SignalingState::Reconnecting;
        info!(attempt, ?delay, "Reconnecting signaling socket");
        let _ = events.send(SignalingEvent::Reconnecting { attempt, delay });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Frame(msg)) => {
                        debug!(kind = msg.message_type(), "Dropping frame while reconnecting");
                    }
                    Some(Outbound::Close) | None => {
                        *state.write() = SignalingState::Closed;
                        return;
                    }
                },
            }
        }
        *state.write() = SignalingState::Connecting;
    }
}

async fn send_frame<S>(sink: &mut S, msg: &ClientMessage) -> Result<(), TransportError>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = msg
        .to_json()
        .map_err(|e| TransportError::Signaling(e.to_string()))?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| TransportError::Signaling(e.to_string()))
}
