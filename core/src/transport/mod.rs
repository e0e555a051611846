// Transport module — backends, connection lifecycle and the peer manager

pub mod abstraction;
pub mod manager;
pub mod memory;
pub mod state;
pub mod tunnel;

pub use abstraction::{BackendEvent, ChannelEvent, ChannelHandle, ChannelSink, TransportBackend};
pub use manager::{Collaborators, ManagerConfig, PeerEvent, PeerManager, RegisterOutcome};
pub use memory::{MemoryBackend, MemoryNetwork};
pub use state::{ConnectionLifecycle, ConnectionState};
pub use tunnel::{RelayTunnel, SignalSender, TunnelFrame};
