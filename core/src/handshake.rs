//! Contact handshake: first-contact identity exchange and validated auto-add
//!
//! The side that opened a channel introduces itself with `contact-info` as
//! soon as the channel opens. The receiving side validates the claim against
//! the channel it arrived on and, if the peer is not yet a contact, stores
//! it and tells the user.

use crate::error::{PeerLinkError, ValidationError};
use crate::identity::IdentityProvider;
use crate::message::types::{ContactInfo, Payload};
use crate::store::{Contact, ContactStore, Notifier, Presence};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Title of the notification raised for a new contact
pub const NEW_CONTACT_TITLE: &str = "New contact";

/// A contact-info claim that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedContact {
    pub peer_id: String,
    pub display_name: String,
}

/// Validate a `contact-info` claim received on a channel from
/// `channel_peer_id`. Checks run in order: not ourselves, claimed id
/// matches the channel, non-blank name.
pub fn validate_contact_info(
    local_peer_id: &str,
    channel_peer_id: &str,
    info: &ContactInfo,
) -> Result<ValidatedContact, ValidationError> {
    let sender = info.peer_id.as_deref().unwrap_or(channel_peer_id);
    if sender == local_peer_id {
        return Err(ValidationError::SelfAddition);
    }
    if sender != channel_peer_id {
        return Err(ValidationError::PeerIdMismatch {
            claimed: sender.to_string(),
            actual: channel_peer_id.to_string(),
        });
    }
    let display_name = info.display_name.trim();
    if display_name.is_empty() {
        return Err(ValidationError::EmptyDisplayName);
    }
    Ok(ValidatedContact {
        peer_id: channel_peer_id.to_string(),
        display_name: display_name.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Added(Contact),
    AlreadyKnown,
}

pub struct ContactHandshake {
    identity: Arc<dyn IdentityProvider>,
    contacts: Arc<dyn ContactStore>,
    notifier: Arc<dyn Notifier>,
    observers: Mutex<Vec<mpsc::UnboundedSender<Contact>>>,
}

impl ContactHandshake {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        contacts: Arc<dyn ContactStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            identity,
            contacts,
            notifier,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Our own introduction
    pub fn introduction(&self) -> Payload {
        Payload::ContactInfo(ContactInfo {
            peer_id: Some(self.identity.peer_id()),
            display_name: self.identity.display_name(),
        })
    }

    /// Observe contacts added by the handshake
    pub fn subscribe_contacts_changed(&self) -> mpsc::UnboundedReceiver<Contact> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().push(tx);
        rx
    }

    pub fn handle(
        &self,
        channel_peer_id: &str,
        info: &ContactInfo,
    ) -> Result<HandshakeOutcome, PeerLinkError> {
        let validated =
            validate_contact_info(&self.identity.peer_id(), channel_peer_id, info)?;

        if self.contacts.get_by_peer_id(&validated.peer_id)?.is_some() {
            debug!(peer = %validated.peer_id, "Contact already known");
            return Ok(HandshakeOutcome::AlreadyKnown);
        }

        let contact = Contact::new(validated.peer_id, validated.display_name)
            .with_presence(Presence::Online);
        self.contacts.upsert(contact.clone())?;
        info!(peer = %contact.peer_id, name = %contact.display_name, "Contact auto-added");

        self.notifier.notify(
            NEW_CONTACT_TITLE,
            &format!("{} added you as a contact", contact.display_name),
        );
        self.observers
            .lock()
            .retain(|tx| tx.send(contact.clone()).is_ok());

        Ok(HandshakeOutcome::Added(contact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;
    use crate::store::{MemoryContactStore, MockNotifier};

    fn info(peer_id: Option<&str>, name: &str) -> ContactInfo {
        ContactInfo {
            peer_id: peer_id.map(str::to_string),
            display_name: name.to_string(),
        }
    }

    fn handshake(notifier: MockNotifier) -> (ContactHandshake, Arc<MemoryContactStore>) {
        let contacts = Arc::new(MemoryContactStore::new());
        let handshake = ContactHandshake::new(
            Arc::new(PeerIdentity::new("a1", "Alice")),
            contacts.clone(),
            Arc::new(notifier),
        );
        (handshake, contacts)
    }

    #[test]
    fn test_validation_order() {
        assert_eq!(
            validate_contact_info("a1", "a1", &info(None, "")),
            Err(ValidationError::SelfAddition)
        );
        assert_eq!(
            validate_contact_info("a1", "Y", &info(Some("X"), "")),
            Err(ValidationError::PeerIdMismatch {
                claimed: "X".to_string(),
                actual: "Y".to_string(),
            })
        );
        assert_eq!(
            validate_contact_info("a1", "b1", &info(Some("b1"), "   ")),
            Err(ValidationError::EmptyDisplayName)
        );
        assert_eq!(
            validate_contact_info("a1", "b1", &info(None, " Bob ")).unwrap(),
            ValidatedContact {
                peer_id: "b1".to_string(),
                display_name: "Bob".to_string(),
            }
        );
    }

    #[test]
    fn test_new_contact_added_and_notified_once() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|title, body| title == "New contact" && body == "Bob added you as a contact")
            .times(1)
            .return_const(());
        let (handshake, contacts) = handshake(notifier);
        let mut changed = handshake.subscribe_contacts_changed();

        let first = handshake.handle("b1", &info(Some("b1"), "Bob")).unwrap();
        assert!(matches!(first, HandshakeOutcome::Added(ref c) if c.presence == Presence::Online));
        let second = handshake.handle("b1", &info(Some("b1"), "Bob")).unwrap();
        assert_eq!(second, HandshakeOutcome::AlreadyKnown);

        assert_eq!(contacts.len(), 1);
        assert_eq!(changed.try_recv().unwrap().peer_id, "b1");
        assert!(changed.try_recv().is_err());
    }

    #[test]
    fn test_spoofed_claim_is_rejected_silently() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(0);
        let (handshake, contacts) = handshake(notifier);

        let err = handshake.handle("Y", &info(Some("X"), "Mallory")).unwrap_err();
        assert!(matches!(
            err,
            PeerLinkError::Validation(ValidationError::PeerIdMismatch { .. })
        ));
        assert!(contacts.is_empty());
    }

    #[test]
    fn test_introduction_carries_local_identity() {
        let (handshake, _) = handshake(MockNotifier::new());
        assert_eq!(
            handshake.introduction(),
            Payload::ContactInfo(ContactInfo {
                peer_id: Some("a1".to_string()),
                display_name: "Alice".to_string(),
            })
        );
    }
}
