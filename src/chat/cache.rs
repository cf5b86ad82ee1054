//! Local message cache of one conversation.
//!
//! Display order is append order. Older pages are prepended as a block,
//! optimistic entries are replaced in place when confirmed, and nothing
//! already cached is ever reordered.

use tracing::trace;

use crate::chat::core::ids::{ClientMessageId, MessageId};
use crate::chat::core::model::{DeliveryStatus, Message};

/// What [`MessageCache::merge_inbound`] did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Replaced the optimistic entry carrying the same client id.
    Reconciled,
    /// Refreshed an entry already known by server id.
    Updated,
    /// Added as a new entry.
    Appended,
}

/// Ordered messages of one conversation.
#[derive(Clone, Debug, Default)]
pub struct MessageCache {
    messages: Vec<Message>,
}

impl MessageCache {
    /// Create an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Messages in display order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of cached messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message with the given id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Whether a message with the given id is cached.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    /// Number of optimistic entries awaiting confirmation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_pending()).count()
    }

    /// Replace the whole content, e.g. with a freshly loaded first page.
    pub fn reset(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Append at the end, ignoring a message whose id is already cached.
    ///
    /// Returns whether the message was added.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Prepend an older page, skipping messages already cached.
    ///
    /// Returns the number of messages added.
    pub fn prepend_older(&mut self, older: Vec<Message>) -> usize {
        let fresh: Vec<Message> = older
            .into_iter()
            .filter(|m| !self.contains(&m.id))
            .collect();
        let added = fresh.len();
        self.messages.splice(0..0, fresh);
        added
    }

    /// Append an optimistic entry.
    pub fn insert_optimistic(&mut self, message: Message) {
        trace!(id = %message.id, "Optimistic insert");
        self.messages.push(message);
    }

    fn position_of_client(&self, client_id: ClientMessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.client_id == Some(client_id))
    }

    /// Replace the entry correlated by `client_id` with the confirmed record,
    /// keeping its position.
    ///
    /// Returns `false` when no such entry exists; the record is then appended
    /// unless already cached.
    pub fn reconcile(&mut self, client_id: ClientMessageId, confirmed: Message) -> bool {
        match self.position_of_client(client_id) {
            Some(index) => {
                trace!(%client_id, id = %confirmed.id, "Reconciled optimistic entry");
                self.messages[index] = confirmed;
                true
            }
            None => {
                self.append(confirmed);
                false
            }
        }
    }

    /// Merge a message delivered by the server.
    ///
    /// An echoed client id replaces the matching optimistic entry; a known
    /// server id refreshes the entry; anything else is appended.
    pub fn merge_inbound(&mut self, message: Message) -> MergeOutcome {
        if let Some(client_id) = message.client_id {
            if let Some(index) = self.position_of_client(client_id) {
                self.messages[index] = message;
                return MergeOutcome::Reconciled;
            }
        }
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return MergeOutcome::Updated;
        }
        self.messages.push(message);
        MergeOutcome::Appended
    }

    /// Remove the optimistic entry correlated by `client_id`.
    pub fn remove_pending(&mut self, client_id: ClientMessageId) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| m.client_id == Some(client_id) && m.is_pending())?;
        Some(self.messages.remove(index))
    }

    /// Update the delivery status of a message.
    ///
    /// Returns whether the message was found.
    pub fn apply_status(&mut self, id: &MessageId, status: DeliveryStatus) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.status = status;
                if status == DeliveryStatus::Read {
                    message.read = true;
                }
                true
            }
            None => false,
        }
    }

    /// Flag every message as read.
    pub fn mark_all_read(&mut self) {
        for message in &mut self.messages {
            message.read = true;
        }
    }
}
