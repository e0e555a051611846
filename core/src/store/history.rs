// Chat message records and the message-store collaborator contract

use crate::error::StoreError;
use crate::time::current_timestamp_ms;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Outgoing,
    Incoming,
}

/// Delivery status of a chat message.
///
/// The send path moves `Sending` to `Sent` or `Failed` synchronously.
/// `Delivered` only ever appears on the receiving side's own record; there
/// is no acknowledgment back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub contact_ref: String,
    pub content: String,
    pub kind: MessageKind,
    pub direction: MessageDirection,
    pub timestamp: u64,
    pub delivery_status: DeliveryStatus,
}

impl ChatMessage {
    pub fn outgoing(id: String, contact_ref: &str, content: String, kind: MessageKind) -> Self {
        Self {
            id,
            contact_ref: contact_ref.to_string(),
            content,
            kind,
            direction: MessageDirection::Outgoing,
            timestamp: current_timestamp_ms(),
            delivery_status: DeliveryStatus::Sending,
        }
    }

    pub fn incoming(
        id: String,
        contact_ref: &str,
        content: String,
        kind: MessageKind,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            contact_ref: contact_ref.to_string(),
            content,
            kind,
            direction: MessageDirection::Incoming,
            timestamp,
            delivery_status: DeliveryStatus::Delivered,
        }
    }
}

pub trait MessageStore: Send + Sync {
    fn append(&self, message: ChatMessage) -> Result<(), StoreError>;
    fn list_by_contact(&self, contact_ref: &str) -> Result<Vec<ChatMessage>, StoreError>;
    fn update_status(&self, message_id: &str, status: DeliveryStatus) -> Result<(), StoreError>;
}

/// In-memory message history, in append order
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        self.messages.write().push(message);
        Ok(())
    }

    fn list_by_contact(&self, contact_ref: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| m.contact_ref == contact_ref)
            .cloned()
            .collect())
    }

    fn update_status(&self, message_id: &str, status: DeliveryStatus) -> Result<(), StoreError> {
        let mut messages = self.messages.write();
        match messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.delivery_status = status;
                Ok(())
            }
            None => Err(StoreError(format!("unknown message {}", message_id))),
        }
    }
}
