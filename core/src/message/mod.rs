// Message module — data-channel envelope, codec and multiplexer

pub mod codec;
pub mod mux;
pub mod types;

pub use codec::{decode_envelope, encode_envelope, MAX_FRAME_SIZE};
pub use mux::{InboundEnvelope, Multiplexer};
pub use types::{ContactInfo, DataEnvelope, FileChunk, FileFrame, FileMetadata, Payload};
