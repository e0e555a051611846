//! Receiving side of the chunked file transfer
//!
//! A metadata frame opens a session with exactly `chunkCount` empty slots.
//! Chunks fill slots in any order; duplicates are no-ops. When every slot
//! is filled the bytes are concatenated in index order and the session is
//! destroyed. Sessions that never complete are evicted by `sweep_expired`.
//!
//! Declared sizes come from the remote peer. Metadata is checked against
//! `MAX_FILE_SIZE` before a session exists, and buffers only ever grow with
//! bytes that actually arrived.

use crate::error::{ProtocolError, ResourceExhaustion};
use crate::message::types::{FileChunk, FileMetadata};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default lifetime of an incomplete session
pub const DEFAULT_TRANSFER_TTL: Duration = Duration::from_secs(120);

/// Largest file a peer may announce: 64 MiB
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Reject metadata no honest sender produces. Every chunk carries at least
/// one byte, so a transfer of `size` bytes has between 1 and `size` chunks.
pub fn validate_metadata(file_id: &str, metadata: &FileMetadata) -> Result<(), ProtocolError> {
    if metadata.size > MAX_FILE_SIZE {
        return Err(ProtocolError::FileTooLarge {
            file_id: file_id.to_string(),
            size: metadata.size,
            limit: MAX_FILE_SIZE,
        });
    }
    let chunks = u64::from(metadata.chunk_count);
    if chunks > metadata.size || (chunks == 0) != (metadata.size == 0) {
        return Err(ProtocolError::InconsistentMetadata {
            file_id: file_id.to_string(),
            size: metadata.size,
            chunk_count: metadata.chunk_count,
        });
    }
    Ok(())
}

/// A fully reassembled file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: String,
    pub peer_id: String,
    pub name: String,
    pub mime_type: String,
    pub preview: Option<String>,
    pub bytes: Vec<u8>,
}

/// Result of accepting one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored { filled: u32, expected: u32 },
    Duplicate,
    /// No session for this file id from this peer; the chunk is discarded
    UnknownTransfer,
    Complete(ReceivedFile),
}

struct TransferSession {
    peer_id: String,
    metadata: FileMetadata,
    slots: HashMap<u32, Vec<u8>>,
    received_bytes: u64,
    filled: u32,
    created_at: Instant,
}

impl TransferSession {
    fn assemble(mut self, file_id: String) -> Option<ReceivedFile> {
        let capacity = usize::try_from(self.received_bytes).ok()?;
        let mut bytes = Vec::with_capacity(capacity);
        for index in 0..self.metadata.chunk_count {
            bytes.extend_from_slice(&self.slots.remove(&index)?);
        }
        if bytes.len() as u64 != self.metadata.size {
            warn!(
                file_id = %file_id,
                declared = self.metadata.size,
                actual = bytes.len(),
                "Reassembled size differs from declared size"
            );
        }
        Some(ReceivedFile {
            file_id,
            peer_id: self.peer_id,
            name: self.metadata.name,
            mime_type: self.metadata.mime_type,
            preview: self.metadata.preview,
            bytes,
        })
    }
}

pub struct FileReassembler {
    sessions: Mutex<HashMap<String, TransferSession>>,
    ttl: Duration,
}

impl FileReassembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Open a session for `file_id`. A zero-chunk transfer completes at once.
    pub fn begin(
        &self,
        peer_id: &str,
        file_id: &str,
        metadata: FileMetadata,
        now: Instant,
    ) -> Result<Option<ReceivedFile>, ProtocolError> {
        validate_metadata(file_id, &metadata)?;

        if metadata.chunk_count == 0 {
            info!(file_id = %file_id, name = %metadata.name, "Empty file received");
            return Ok(Some(ReceivedFile {
                file_id: file_id.to_string(),
                peer_id: peer_id.to_string(),
                name: metadata.name,
                mime_type: metadata.mime_type,
                preview: metadata.preview,
                bytes: Vec::new(),
            }));
        }

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(file_id) {
            debug!(file_id = %file_id, "Ignoring repeated metadata frame");
            return Ok(None);
        }
        debug!(
            file_id = %file_id,
            peer = %peer_id,
            chunks = metadata.chunk_count,
            "Transfer session opened"
        );
        sessions.insert(
            file_id.to_string(),
            TransferSession {
                peer_id: peer_id.to_string(),
                slots: HashMap::new(),
                received_bytes: 0,
                filled: 0,
                metadata,
                created_at: now,
            },
        );
        Ok(None)
    }

    pub fn accept_chunk(
        &self,
        peer_id: &str,
        chunk: FileChunk,
    ) -> Result<ChunkOutcome, ProtocolError> {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions
            .get_mut(&chunk.file_id)
            .filter(|s| s.peer_id == peer_id)
        else {
            return Ok(ChunkOutcome::UnknownTransfer);
        };

        let expected = session.metadata.chunk_count;
        let index = chunk.chunk_index;
        if index >= expected {
            return Err(ProtocolError::ChunkOutOfRange {
                file_id: chunk.file_id,
                index,
                chunk_count: expected,
            });
        }
        if session.slots.contains_key(&index) {
            return Ok(ChunkOutcome::Duplicate);
        }

        let received = session.received_bytes + chunk.data.len() as u64;
        if received > session.metadata.size {
            return Err(ProtocolError::FileTooLarge {
                file_id: chunk.file_id,
                size: received,
                limit: session.metadata.size,
            });
        }
        session.received_bytes = received;
        session.slots.insert(index, chunk.data);
        session.filled += 1;

        if session.filled < expected {
            return Ok(ChunkOutcome::Stored {
                filled: session.filled,
                expected,
            });
        }

        let Some(session) = sessions.remove(&chunk.file_id) else {
            return Ok(ChunkOutcome::UnknownTransfer);
        };
        match session.assemble(chunk.file_id.clone()) {
            Some(file) => {
                info!(file_id = %file.file_id, bytes = file.bytes.len(), "File reassembled");
                Ok(ChunkOutcome::Complete(file))
            }
            None => Err(ProtocolError::Malformed(format!(
                "transfer {} reported complete with empty slots",
                chunk.file_id
            ))),
        }
    }

    /// Evict sessions older than the TTL
    pub fn sweep_expired(&self, now: Instant) -> Vec<ResourceExhaustion> {
        let mut expired = Vec::new();
        self.sessions.lock().retain(|file_id, session| {
            if now.saturating_duration_since(session.created_at) < self.ttl {
                return true;
            }
            expired.push(ResourceExhaustion::TransferExpired {
                file_id: file_id.clone(),
                peer_id: session.peer_id.clone(),
                filled: session.filled,
                expected: session.metadata.chunk_count,
            });
            false
        });
        expired
    }

    /// `(filled, expected)` for an open session
    pub fn progress(&self, file_id: &str) -> Option<(u32, u32)> {
        self.sessions
            .lock()
            .get(file_id)
            .map(|s| (s.filled, s.metadata.chunk_count))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Default for FileReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFER_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metadata(chunk_count: u32, size: u64) -> FileMetadata {
        FileMetadata {
            name: "notes.txt".to_string(),
            size,
            mime_type: "text/plain".to_string(),
            chunk_count,
            preview: None,
        }
    }

    fn chunk(index: u32, data: &[u8]) -> FileChunk {
        FileChunk {
            file_id: "f1".to_string(),
            chunk_index: index,
            data: data.to_vec(),
        }
    }

    const PARTS: [&[u8]; 4] = [b"aa", b"bb", b"cc", b"d"];

    #[test]
    fn test_out_of_order_with_duplicate() {
        let reassembler = FileReassembler::default();
        assert!(reassembler
            .begin("b1", "f1", metadata(4, 7), Instant::now())
            .unwrap()
            .is_none());

        assert_eq!(
            reassembler.accept_chunk("b1", chunk(2, PARTS[2])).unwrap(),
            ChunkOutcome::Stored { filled: 1, expected: 4 }
        );
        reassembler.accept_chunk("b1", chunk(0, PARTS[0])).unwrap();
        reassembler.accept_chunk("b1", chunk(3, PARTS[3])).unwrap();
        assert_eq!(
            reassembler.accept_chunk("b1", chunk(2, PARTS[2])).unwrap(),
            ChunkOutcome::Duplicate
        );
        assert_eq!(reassembler.progress("f1"), Some((3, 4)));

        match reassembler.accept_chunk("b1", chunk(1, PARTS[1])).unwrap() {
            ChunkOutcome::Complete(file) => assert_eq!(file.bytes, b"aabbccd"),
            other => panic!("Expected completion, got {:?}", other),
        }
        assert_eq!(reassembler.session_count(), 0);
        assert_eq!(
            reassembler.accept_chunk("b1", chunk(2, PARTS[2])).unwrap(),
            ChunkOutcome::UnknownTransfer
        );
    }

    #[test]
    fn test_chunk_without_session_discarded() {
        let reassembler = FileReassembler::default();
        assert_eq!(
            reassembler.accept_chunk("b1", chunk(0, b"x")).unwrap(),
            ChunkOutcome::UnknownTransfer
        );
    }

    #[test]
    fn test_chunk_from_other_peer_discarded() {
        let reassembler = FileReassembler::default();
        reassembler.begin("b1", "f1", metadata(1, 1), Instant::now()).unwrap();
        assert_eq!(
            reassembler.accept_chunk("c1", chunk(0, b"x")).unwrap(),
            ChunkOutcome::UnknownTransfer
        );
        assert_eq!(reassembler.progress("f1"), Some((0, 1)));
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let reassembler = FileReassembler::default();
        reassembler.begin("b1", "f1", metadata(2, 2), Instant::now()).unwrap();
        let err = reassembler.accept_chunk("b1", chunk(2, b"x")).unwrap_err();
        assert!(matches!(err, ProtocolError::ChunkOutOfRange { index: 2, .. }));
        assert_eq!(reassembler.progress("f1"), Some((0, 2)));
    }

    #[test]
    fn test_zero_chunks_completes_immediately() {
        let reassembler = FileReassembler::default();
        let file = reassembler
            .begin("b1", "f1", metadata(0, 0), Instant::now())
            .unwrap()
            .expect("empty file completes");
        assert!(file.bytes.is_empty());
        assert_eq!(reassembler.session_count(), 0);
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let reassembler = FileReassembler::new(Duration::from_secs(120));
        let start = Instant::now();
        reassembler.begin("b1", "old", metadata(2, 2), start).unwrap();
        reassembler
            .begin("b1", "new", metadata(2, 2), start + Duration::from_secs(100))
            .unwrap();

        let expired = reassembler.sweep_expired(start + Duration::from_secs(130));
        assert_eq!(
            expired,
            vec![ResourceExhaustion::TransferExpired {
                file_id: "old".to_string(),
                peer_id: "b1".to_string(),
                filled: 0,
                expected: 2,
            }]
        );
        assert_eq!(reassembler.session_count(), 1);
        assert!(reassembler.progress("new").is_some());
    }

    #[test]
    fn test_oversized_metadata_rejected_without_session() {
        let reassembler = FileReassembler::default();
        let err = reassembler
            .begin("b1", "f1", metadata(1, 1 << 60), Instant::now())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FileTooLarge { .. }));
        assert_eq!(reassembler.session_count(), 0);
        assert_eq!(
            reassembler.accept_chunk("b1", chunk(0, b"x")).unwrap(),
            ChunkOutcome::UnknownTransfer
        );
    }

    #[test]
    fn test_inconsistent_metadata_rejected() {
        let reassembler = FileReassembler::default();
        for (chunks, size) in [(u32::MAX, 10), (0, 5), (3, 0)] {
            let err = reassembler
                .begin("b1", "f1", metadata(chunks, size), Instant::now())
                .unwrap_err();
            assert!(
                matches!(err, ProtocolError::InconsistentMetadata { .. }),
                "{} chunks / {} bytes: {:?}",
                chunks,
                size,
                err
            );
        }
        assert_eq!(reassembler.session_count(), 0);
    }

    #[test]
    fn test_chunks_beyond_declared_size_rejected() {
        let reassembler = FileReassembler::default();
        reassembler
            .begin("b1", "f1", metadata(2, 3), Instant::now())
            .unwrap();

        reassembler.accept_chunk("b1", chunk(0, b"ab")).unwrap();
        let err = reassembler.accept_chunk("b1", chunk(1, b"cdef")).unwrap_err();
        assert!(matches!(err, ProtocolError::FileTooLarge { size: 6, limit: 3, .. }));
        assert_eq!(reassembler.progress("f1"), Some((1, 2)));

        match reassembler.accept_chunk("b1", chunk(1, b"c")).unwrap() {
            ChunkOutcome::Complete(file) => assert_eq!(file.bytes, b"abc"),
            other => panic!("Expected completion, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn prop_any_delivery_order_reassembles(
            data in proptest::collection::vec(any::<u8>(), 1..200),
            chunk_size in 1usize..32,
            seed in any::<u64>(),
        ) {
            let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
            let count = chunks.len() as u32;
            let reassembler = FileReassembler::default();
            reassembler
                .begin("b1", "f1", metadata(count, data.len() as u64), Instant::now())
                .unwrap();

            let mut order: Vec<u32> = (0..count).collect();
            let len = order.len();
            let mut state = seed;
            for i in (1..len).rev() {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let j = ((state >> 33) % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }
            // Replay one chunk to exercise duplicate handling
            order.insert(0, order[len - 1]);

            let mut completed = None;
            for index in order {
                let outcome = reassembler
                    .accept_chunk("b1", chunk(index, chunks[index as usize]))
                    .unwrap();
                if let Some((filled, expected)) = reassembler.progress("f1") {
                    prop_assert!(filled <= expected);
                }
                if let ChunkOutcome::Complete(file) = outcome {
                    completed = Some(file);
                }
            }
            prop_assert_eq!(completed.map(|f| f.bytes), Some(data.clone()));
        }
    }
}
