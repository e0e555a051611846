// Message history for the PeerLink CLI
//
// Sled-backed `MessageStore`. Keys are `<timestamp>_<id>` so iteration is
// chronological.

use anyhow::{Context, Result};
use peerlink_core::error::StoreError;
use peerlink_core::{ChatMessage, DeliveryStatus, MessageStore};
use sled::Db;
use std::path::PathBuf;

pub struct SledMessageStore {
    db: Db,
}

impl SledMessageStore {
    /// Open or create message history database
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = sled::open(path).context("Failed to open message history database")?;
        Ok(Self { db })
    }

    /// Most recent messages first, optionally for one contact
    pub fn recent(&self, contact_filter: Option<&str>, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();

        for item in self.db.iter().rev() {
            let (_, value) = item?;
            let record = Self::decode(&value)?;

            if let Some(contact) = contact_filter {
                if record.contact_ref != contact {
                    continue;
                }
            }

            messages.push(record);

            if messages.len() >= limit {
                break;
            }
        }

        Ok(messages)
    }

    /// Search messages by content
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let query_lower = query.to_lowercase();
        let mut results = Vec::new();

        for item in self.db.iter().rev() {
            let (_, value) = item?;
            let record = Self::decode(&value)?;

            if record.content.to_lowercase().contains(&query_lower) {
                results.push(record);

                if results.len() >= limit {
                    break;
                }
            }
        }

        Ok(results)
    }

    pub fn count(&self) -> usize {
        self.db.len()
    }

    fn key(message: &ChatMessage) -> String {
        format!("{:020}_{}", message.timestamp, message.id)
    }

    fn decode(value: &[u8]) -> Result<ChatMessage, StoreError> {
        serde_json::from_slice(value).map_err(|e| StoreError(format!("corrupt message: {}", e)))
    }
}

impl MessageStore for SledMessageStore {
    fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&message).map_err(|e| StoreError(e.to_string()))?;
        self.db
            .insert(Self::key(&message).as_bytes(), value)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    fn list_by_contact(&self, contact_ref: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item.map_err(|e| StoreError(e.to_string()))?;
            let record = Self::decode(&value)?;
            if record.contact_ref == contact_ref {
                messages.push(record);
            }
        }
        Ok(messages)
    }

    fn update_status(&self, message_id: &str, status: DeliveryStatus) -> Result<(), StoreError> {
        // Newest first: status updates follow their append closely
        for item in self.db.iter().rev() {
            let (key, value) = item.map_err(|e| StoreError(e.to_string()))?;
            let mut record = Self::decode(&value)?;
            if record.id == message_id {
                record.delivery_status = status;
                let value = serde_json::to_vec(&record).map_err(|e| StoreError(e.to_string()))?;
                self.db
                    .insert(key, value)
                    .map_err(|e| StoreError(e.to_string()))?;
                return Ok(());
            }
        }
        Err(StoreError(format!("unknown message {}", message_id)))
    }
}
