//! Error taxonomy for the peer connection layer.
//!
//! Failures are scoped to the peer or transfer they concern. Nothing here is
//! fatal to the manager as a whole.

use crate::transport::state::ConnectionState;
use thiserror::Error;

/// Socket or channel failure. Drives connection state transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No open channel to {0}")]
    NotOpen(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Connection to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },
    #[error("Transport backend not initialized")]
    NotInitialized,
    #[error("Transport backend destroyed")]
    Destroyed,
    #[error("Signaling error: {0}")]
    Signaling(String),
}

/// Malformed or undecodable frame. Logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Chunk {index} out of range for transfer {file_id} ({chunk_count} chunks)")]
    ChunkOutOfRange {
        file_id: String,
        index: u32,
        chunk_count: u32,
    },
    #[error("Transfer {file_id} is {size} bytes, limit is {limit}")]
    FileTooLarge { file_id: String, size: u64, limit: u64 },
    #[error("Transfer {file_id} declares {chunk_count} chunks for {size} bytes")]
    InconsistentMetadata {
        file_id: String,
        size: u64,
        chunk_count: u32,
    },
}

/// Handshake rejection. Silently dropped, never surfaced to the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Refusing to add self as a contact")]
    SelfAddition,
    #[error("Claimed peer id {claimed} does not match channel peer {actual}")]
    PeerIdMismatch { claimed: String, actual: String },
    #[error("Display name is empty")]
    EmptyDisplayName,
}

/// A receive-side transfer that never completed and was evicted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceExhaustion {
    #[error("Transfer {file_id} from {peer_id} expired with {filled}/{expected} chunks")]
    TransferExpired {
        file_id: String,
        peer_id: String,
        filled: u32,
        expected: u32,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition {from:?} -> {to:?} for peer {peer_id}")]
    InvalidTransition {
        peer_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Failure reported by an external collaborator store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Store error: {0}")]
pub struct StoreError(pub String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerLinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resource(#[from] ResourceExhaustion),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
