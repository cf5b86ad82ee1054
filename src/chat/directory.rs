//! Conversation list and per-conversation message caches.
//!
//! The directory keeps every visible conversation's preview fresh whatever
//! conversation is open, and routes inbound messages into the open one's
//! cache only when their scope matches. Caches of conversations switched
//! away from are kept in an LRU so switching back does not start empty, and
//! keep receiving their own messages while in the background.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, info};

use crate::chat::api::client::ChatBackend;
use crate::chat::cache::{MergeOutcome, MessageCache};
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::ConversationId;
use crate::chat::core::model::{Conversation, ConversationRef, Message};

/// Where an inbound message ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Routed {
    /// A conversation preview was refreshed.
    pub preview_updated: bool,
    /// Outcome of the merge into the open conversation, if it belonged there.
    pub active: Option<MergeOutcome>,
    /// Outcome of the merge into a kept cache of another conversation.
    pub background: Option<MergeOutcome>,
}

/// Conversations visible to the viewer.
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
    caches: LruCache<ConversationId, MessageCache>,
}

impl ConversationDirectory {
    /// Create an empty directory keeping up to `cache_capacity` caches.
    ///
    /// # Errors
    /// Returns an error if `cache_capacity` is zero.
    pub fn new(cache_capacity: usize) -> ChatResult<Self> {
        let capacity = NonZeroUsize::new(cache_capacity)
            .ok_or_else(|| ChatError::Config("cache_capacity must be > 0".to_string()))?;
        Ok(Self {
            conversations: Vec::new(),
            active: None,
            caches: LruCache::new(capacity),
        })
    }

    /// Fetch the list and auto-select the first conversation if none is open.
    ///
    /// Returns the newly selected conversation, if any.
    ///
    /// # Errors
    /// Returns an error if the backend call fails; the current list stays.
    pub async fn refresh(
        &mut self,
        backend: &dyn ChatBackend,
    ) -> ChatResult<Option<ConversationRef>> {
        let conversations = backend.list_conversations().await?;
        info!(count = conversations.len(), "Conversation list loaded");
        Ok(self.replace(conversations))
    }

    /// Install a conversation list, keeping the selection when still listed.
    ///
    /// Returns the newly selected conversation, if the selection changed.
    pub fn replace(&mut self, conversations: Vec<Conversation>) -> Option<ConversationRef> {
        self.conversations = conversations;
        let still_listed = self
            .active
            .as_ref()
            .is_some_and(|id| self.conversations.iter().any(|c| &c.id == id));
        if still_listed {
            return None;
        }

        self.active = self.conversations.first().map(|c| c.id.clone());
        let selected = self.active_conversation().map(Conversation::reference);
        if let Some(scope) = &selected {
            debug!(%scope, "Auto-selected first conversation");
        }
        selected
    }

    /// Add a conversation, or refresh it if already listed, at the top.
    pub fn upsert(&mut self, conversation: Conversation) {
        self.conversations.retain(|c| c.id != conversation.id);
        self.conversations.insert(0, conversation);
    }

    /// Visible conversations.
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Conversation with the given id.
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Conversation an event scope refers to.
    #[must_use]
    fn find_by_scope(&self, scope: &ConversationRef) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.matches(scope))
    }

    /// The open conversation.
    #[must_use]
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.get(id))
    }

    /// Open a listed conversation.
    ///
    /// # Errors
    /// Returns [`ChatError::NoActiveConversation`] if it is not listed.
    pub fn select(&mut self, id: &ConversationId) -> ChatResult<ConversationRef> {
        let scope = self
            .get(id)
            .map(Conversation::reference)
            .ok_or(ChatError::NoActiveConversation)?;
        self.active = Some(id.clone());
        self.caches.get_or_insert_mut(id.clone(), MessageCache::new);
        info!(%scope, "Conversation selected");
        Ok(scope)
    }

    /// Cache of a conversation, if one is kept.
    #[must_use]
    pub fn cache(&self, id: &ConversationId) -> Option<&MessageCache> {
        self.caches.peek(id)
    }

    /// Cache of the open conversation, created on demand.
    pub fn active_cache_mut(&mut self) -> Option<&mut MessageCache> {
        let id = self.active.clone()?;
        Some(self.caches.get_or_insert_mut(id, MessageCache::new))
    }

    /// Cache of the open conversation.
    #[must_use]
    pub fn active_cache(&self) -> Option<&MessageCache> {
        self.active.as_ref().and_then(|id| self.caches.peek(id))
    }

    /// Route an inbound message.
    ///
    /// The matching preview is refreshed unconditionally. The open
    /// conversation's cache receives the message only when the scope is that
    /// conversation's; a kept cache of a conversation switched away from
    /// receives it too, so pending sends there reconcile. A message with no
    /// stated scope belongs to the open conversation, the connection being
    /// scoped to it.
    pub fn route_message(&mut self, scope: Option<&ConversationRef>, message: Message) -> Routed {
        let mut routed = Routed {
            preview_updated: false,
            active: None,
            background: None,
        };
        let target = match scope {
            Some(scope) => self.find_by_scope(scope).map(|c| c.id.clone()),
            None => self.active.clone(),
        };
        let Some(target) = target else {
            debug!(scope = ?scope, "Message for an unlisted conversation");
            return routed;
        };

        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == target) {
            conversation.record_message(&message);
            routed.preview_updated = true;
        }

        if self.active.as_ref() == Some(&target) {
            if let Some(cache) = self.active_cache_mut() {
                routed.active = Some(cache.merge_inbound(message));
            }
        } else if let Some(cache) = self.caches.peek_mut(&target) {
            debug!(conversation_id = %target, "Message for a background conversation");
            routed.background = Some(cache.merge_inbound(message));
        } else {
            debug!(conversation_id = %target, "Message for a background conversation");
        }
        routed
    }
}

impl std::fmt::Debug for ConversationDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationDirectory")
            .field("conversations", &self.conversations.len())
            .field("active", &self.active)
            .field("caches", &self.caches.len())
            .finish()
    }
}
