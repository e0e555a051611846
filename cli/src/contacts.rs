// Contact list for the PeerLink CLI
//
// Sled-backed implementation of the core `ContactStore`, keyed by peer id.
// The peer manager writes presence and handshake additions through it.

use anyhow::{Context, Result};
use peerlink_core::error::StoreError;
use peerlink_core::{Contact, ContactStore};
use sled::Db;
use std::path::PathBuf;

pub struct SledContactStore {
    db: Db,
}

impl SledContactStore {
    /// Open or create contact list database
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = sled::open(path).context("Failed to open contacts database")?;
        Ok(Self { db })
    }

    pub fn remove(&self, peer_id: &str) -> Result<()> {
        self.db.remove(peer_id.as_bytes())?;
        Ok(())
    }

    /// Resolve a peer id or a display name (case-insensitive)
    pub fn find(&self, query: &str) -> Result<Option<Contact>> {
        if let Some(contact) = self.get_by_peer_id(query)? {
            return Ok(Some(contact));
        }
        let query_lower = query.to_lowercase();
        Ok(self
            .get_all()?
            .into_iter()
            .find(|c| c.display_name.to_lowercase() == query_lower))
    }

    /// Search by peer id or display name substring
    pub fn search(&self, query: &str) -> Result<Vec<Contact>> {
        let query_lower = query.to_lowercase();
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|c| {
                c.peer_id.to_lowercase().contains(&query_lower)
                    || c.display_name.to_lowercase().contains(&query_lower)
            })
            .collect())
    }

    pub fn count(&self) -> usize {
        self.db.len()
    }

    fn decode(value: &[u8]) -> Result<Contact, StoreError> {
        serde_json::from_slice(value).map_err(|e| StoreError(format!("corrupt contact: {}", e)))
    }
}

impl ContactStore for SledContactStore {
    fn get_all(&self) -> Result<Vec<Contact>, StoreError> {
        let mut contacts = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item.map_err(|e| StoreError(e.to_string()))?;
            contacts.push(Self::decode(&value)?);
        }
        contacts.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(contacts)
    }

    fn get_by_peer_id(&self, peer_id: &str) -> Result<Option<Contact>, StoreError> {
        match self
            .db
            .get(peer_id.as_bytes())
            .map_err(|e| StoreError(e.to_string()))?
        {
            Some(value) => Self::decode(&value).map(Some),
            None => Ok(None),
        }
    }

    fn upsert(&self, contact: Contact) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&contact).map_err(|e| StoreError(e.to_string()))?;
        self.db
            .insert(contact.peer_id.as_bytes(), value)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }
}
