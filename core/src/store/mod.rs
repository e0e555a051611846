// Store module — collaborator contracts for contacts, history and notifications

pub mod contacts;
pub mod history;

pub use contacts::{Contact, ContactStore, MemoryContactStore, Presence};
pub use history::{
    ChatMessage, DeliveryStatus, MemoryMessageStore, MessageDirection, MessageKind, MessageStore,
};

/// Sink for user-visible notifications (desktop, audio, terminal...)
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::info!(%title, %body, "notification");
    }
}
