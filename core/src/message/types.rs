// Data-channel message types exchanged once peers are connected

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame on a direct channel: `{type, messageId, timestamp, data}`
#[derive(Debug, Clone, PartialEq)]
pub struct DataEnvelope {
    /// Unique message ID (UUID v4)
    pub message_id: String,
    /// Sender clock, unix millis
    pub timestamp: u64,
    pub payload: Payload,
}

impl DataEnvelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: crate::time::current_timestamp_ms(),
            payload,
        }
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }
}

/// Closed set of logical message types. `type` names the variant and
/// `data` carries its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Payload {
    Chat {
        content: String,
    },
    File(FileFrame),
    #[serde(rename_all = "camelCase")]
    Typing {
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        message_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    CallOffer {
        call_type: String,
        sdp: Value,
    },
    CallAnswer {
        sdp: Value,
    },
    CallEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ContactInfo(ContactInfo),
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Chat { .. } => "chat",
            Payload::File(_) => "file",
            Payload::Typing { .. } => "typing",
            Payload::ReadReceipt { .. } => "read-receipt",
            Payload::CallOffer { .. } => "call-offer",
            Payload::CallAnswer { .. } => "call-answer",
            Payload::CallEnd { .. } => "call-end",
            Payload::ContactInfo(_) => "contact-info",
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Payload::CallOffer { .. } | Payload::CallAnswer { .. } | Payload::CallEnd { .. }
        )
    }
}

/// A `file` frame is a chunk when `fileId` is present, metadata otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileFrame {
    Chunk(FileChunk),
    Metadata(FileMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub chunk_count: u32,
    /// Optional small preview, e.g. a data URL for images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// First-contact introduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub display_name: String,
}

/// Chunk bytes travel as standard base64 inside JSON
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
