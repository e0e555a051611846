// File transfer: chunking on send, reassembly on receive

pub mod receiver;
pub mod sender;

pub use receiver::{
    validate_metadata, ChunkOutcome, FileReassembler, ReceivedFile, DEFAULT_TRANSFER_TTL,
    MAX_FILE_SIZE,
};
pub use sender::{chunk_count, FileSender, OutgoingFile, CHUNK_SIZE};
