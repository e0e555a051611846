//! Local peer identity.
//!
//! The id is an opaque stable string chosen once at onboarding. It is the
//! key the relay routes on and the key contacts are stored under.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub id: String,
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Create a fresh identity with a random UUID v4 id
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), display_name)
    }
}

/// Supplies the identity of the local endpoint.
pub trait IdentityProvider: Send + Sync {
    fn peer_id(&self) -> String;
    fn display_name(&self) -> String;

    fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.peer_id(), self.display_name())
    }
}

impl IdentityProvider for PeerIdentity {
    fn peer_id(&self) -> String {
        self.id.clone()
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }
}
