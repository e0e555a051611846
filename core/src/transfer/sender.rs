//! Sending side of the chunked file transfer
//!
//! One metadata frame, then `chunkCount` chunk frames in index order. The
//! metadata frame's message id is the transfer id the chunks reference.

use crate::error::PeerLinkError;
use crate::message::codec::encode_envelope;
use crate::message::types::{DataEnvelope, FileChunk, FileFrame, FileMetadata, Payload};
use crate::transport::abstraction::ChannelSink;
use tracing::{debug, warn};

/// Chunk size on the wire: 16 KiB
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: usize, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1);
    size.div_ceil(chunk_size) as u32
}

/// A file queued for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub preview: Option<String>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
            preview: None,
        }
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }
}

/// Frames for one outgoing transfer
pub struct FileSender<'a> {
    file: &'a OutgoingFile,
    chunk_size: usize,
    metadata: DataEnvelope,
}

impl<'a> FileSender<'a> {
    pub fn new(file: &'a OutgoingFile, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let metadata = DataEnvelope::new(Payload::File(FileFrame::Metadata(FileMetadata {
            name: file.name.clone(),
            size: file.bytes.len() as u64,
            mime_type: file.mime_type.clone(),
            chunk_count: chunk_count(file.bytes.len(), chunk_size),
            preview: file.preview.clone(),
        })));
        Self {
            file,
            chunk_size,
            metadata,
        }
    }

    /// Transfer id, shared by the metadata frame and every chunk
    pub fn file_id(&self) -> &str {
        &self.metadata.message_id
    }

    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.file.bytes.len(), self.chunk_size)
    }

    pub fn metadata(&self) -> &DataEnvelope {
        &self.metadata
    }

    /// Chunk envelopes in index order
    pub fn chunks(&self) -> impl Iterator<Item = DataEnvelope> + '_ {
        self.file
            .bytes
            .chunks(self.chunk_size)
            .enumerate()
            .map(move |(index, data)| {
                DataEnvelope::new(Payload::File(FileFrame::Chunk(FileChunk {
                    file_id: self.file_id().to_string(),
                    chunk_index: index as u32,
                    data: data.to_vec(),
                })))
            })
    }

    /// Write every frame to `sink`, stopping at the first failure
    pub fn send(&self, sink: &dyn ChannelSink) -> Result<(), PeerLinkError> {
        sink.send(&encode_envelope(&self.metadata)?)?;

        for (index, chunk) in self.chunks().enumerate() {
            if let Err(e) = sink.send(&encode_envelope(&chunk)?) {
                warn!(
                    file_id = %self.file_id(),
                    index,
                    "Aborting transfer: {}",
                    e
                );
                return Err(e.into());
            }
        }

        debug!(
            file_id = %self.file_id(),
            chunks = self.chunk_count(),
            "File frames sent"
        );
        Ok(())
    }
}
