// PeerLink Core — peer connection and messaging protocol layer
//
// Two endpoints find each other through a small coordination relay, then
// talk over a direct channel. The relay never sees message content and
// nothing is stored server-side.

pub mod error;
pub mod handshake;
pub mod identity;
pub mod message;
pub mod relay;
pub mod store;
pub mod time;
pub mod transfer;
pub mod transport;

pub use error::{
    PeerLinkError, ProtocolError, ResourceExhaustion, StateError, StoreError, TransportError,
    ValidationError,
};
pub use handshake::{validate_contact_info, ContactHandshake, HandshakeOutcome};
pub use identity::{IdentityProvider, PeerIdentity};
pub use message::{DataEnvelope, InboundEnvelope, Multiplexer, Payload};
pub use relay::{
    ClientMessage, RelayServer, RelayServerConfig, ServerMessage, SignalingClient,
    SignalingConfig, SignalingEvent,
};
pub use store::{
    ChatMessage, Contact, ContactStore, DeliveryStatus, LogNotifier, MemoryContactStore,
    MemoryMessageStore, MessageStore, Notifier, Presence,
};
pub use transfer::{OutgoingFile, ReceivedFile};
pub use transport::{
    Collaborators, ConnectionState, ManagerConfig, MemoryNetwork, PeerEvent, PeerManager,
    RegisterOutcome, RelayTunnel, TransportBackend,
};
