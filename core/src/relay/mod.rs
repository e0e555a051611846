//! Coordination relay
//!
//! The relay is a stateless router from peer id to live signaling socket.
//! It forwards opaque frames between peers and holds no message content.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ReconnectPolicy, SignalingClient, SignalingConfig, SignalingEvent, SignalingState};
pub use protocol::{ClientMessage, ServerMessage, STATUS_OFFLINE, STATUS_ONLINE, TARGET_UNAVAILABLE};
pub use server::{ConnectionId, RelayServer, RelayServerConfig, RelayServerError, RelayServerStats};
