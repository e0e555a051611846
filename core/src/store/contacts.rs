// Contact records and the contact-store collaborator contract
//
// The persistent store itself lives outside this crate. The manager only
// consumes it through get-all / get-by-peer-id / upsert.

use crate::error::StoreError;
use crate::time::current_timestamp_ms;
use crate::transport::state::ConnectionState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Presence of a peer as observed by the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
    Connecting,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
            Presence::Connecting => "connecting",
        }
    }

    /// Map a relay `peer-status` string. Anything that is not "offline"
    /// means the peer holds a live signaling socket.
    pub fn from_status(status: &str) -> Self {
        match status {
            "offline" => Presence::Offline,
            "connecting" => Presence::Connecting,
            _ => Presence::Online,
        }
    }
}

impl From<ConnectionState> for Presence {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => Presence::Online,
            ConnectionState::Connecting => Presence::Connecting,
            ConnectionState::Disconnected | ConnectionState::Failed => Presence::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub peer_id: String,
    pub display_name: String,
    pub presence: Presence,
    /// When the contact was added (unix millis)
    pub added_at: u64,
    /// Last time a channel to this contact was open (unix millis)
    pub last_seen: Option<u64>,
}

impl Contact {
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            presence: Presence::Offline,
            added_at: current_timestamp_ms(),
            last_seen: None,
        }
    }

    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = presence;
        self
    }
}

pub trait ContactStore: Send + Sync {
    fn get_all(&self) -> Result<Vec<Contact>, StoreError>;
    fn get_by_peer_id(&self, peer_id: &str) -> Result<Option<Contact>, StoreError>;
    fn upsert(&self, contact: Contact) -> Result<(), StoreError>;
}

/// In-memory contact store for tests and embedding
#[derive(Default)]
pub struct MemoryContactStore {
    contacts: RwLock<HashMap<String, Contact>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }
}

impl ContactStore for MemoryContactStore {
    fn get_all(&self) -> Result<Vec<Contact>, StoreError> {
        let mut contacts: Vec<Contact> = self.contacts.read().values().cloned().collect();
        contacts.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(contacts)
    }

    fn get_by_peer_id(&self, peer_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.contacts.read().get(peer_id).cloned())
    }

    fn upsert(&self, contact: Contact) -> Result<(), StoreError> {
        self.contacts
            .write()
            .insert(contact.peer_id.clone(), contact);
        Ok(())
    }
}
