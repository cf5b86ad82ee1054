//! Paginated history loading.
//!
//! Page 1 holds the newest `page_size` messages, each following page moves
//! strictly backward in time. Pages are handed back oldest first and older
//! pages are prepended to the cache as a block.

use tracing::{debug, warn};

use crate::chat::api::client::ChatBackend;
use crate::chat::cache::MessageCache;
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::model::{ConversationRef, Message};

/// One page of history.
#[derive(Clone, Debug)]
pub struct HistoryPage {
    /// Page number, starting at 1.
    pub page: u32,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Whether an older page may exist.
    pub has_more: bool,
}

/// Fetch one page and order it by timestamp.
///
/// # Errors
/// Returns [`ChatError::Load`] if the backend call fails.
pub async fn load_page(
    backend: &dyn ChatBackend,
    scope: &ConversationRef,
    page: u32,
    page_size: u32,
) -> ChatResult<HistoryPage> {
    let mut messages = backend
        .fetch_history(scope, page, page_size)
        .await
        .map_err(ChatError::Load)?;
    messages.sort_by_key(|m| m.timestamp);

    let has_more = u32::try_from(messages.len()).unwrap_or(u32::MAX) >= page_size;
    debug!(%scope, page, count = messages.len(), has_more, "History page loaded");
    Ok(HistoryPage {
        page,
        messages,
        has_more,
    })
}

/// Pagination cursor of one conversation.
#[derive(Clone, Debug)]
pub struct HistoryLoader {
    scope: ConversationRef,
    page_size: u32,
    loaded_pages: u32,
    has_more: bool,
    loading: bool,
}

impl HistoryLoader {
    /// Cursor positioned before page 1.
    #[must_use]
    pub const fn new(scope: ConversationRef, page_size: u32) -> Self {
        Self {
            scope,
            page_size,
            loaded_pages: 0,
            has_more: true,
            loading: false,
        }
    }

    /// Conversation paginated.
    #[must_use]
    pub const fn scope(&self) -> &ConversationRef {
        &self.scope
    }

    /// Whether an older page may exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether a load is in flight.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// Claim the next older page.
    ///
    /// Returns `None`, leaving the cursor untouched, while a load is in
    /// flight or when no older page exists.
    pub fn begin_older(&mut self) -> Option<u32> {
        if self.loading || !self.has_more {
            return None;
        }
        self.loading = true;
        Some(self.loaded_pages + 1)
    }

    /// Release the claim taken by [`Self::begin_older`] and record the outcome.
    pub fn complete(&mut self, result: &ChatResult<HistoryPage>) {
        self.loading = false;
        if let Ok(page) = result {
            self.loaded_pages = self.loaded_pages.max(page.page);
            self.has_more = page.has_more;
        }
    }

    /// Load page 1 into `cache`, keeping optimistic entries still in flight.
    ///
    /// An optimistic entry whose client id appears in the page was confirmed
    /// while the conversation was not open and is replaced by the stored
    /// message.
    ///
    /// # Errors
    /// Returns [`ChatError::Load`] on failure; the cache is left unchanged.
    pub async fn load_first(
        &mut self,
        backend: &dyn ChatBackend,
        cache: &mut MessageCache,
    ) -> ChatResult<usize> {
        self.loading = true;
        let result = load_page(backend, &self.scope, 1, self.page_size).await;
        self.loading = false;

        let page = result.inspect_err(|err| warn!(scope = %self.scope, %err, "Initial history load failed"))?;
        self.loaded_pages = 1;
        self.has_more = page.has_more;

        // pending entries the page already confirms are dropped
        let pending: Vec<Message> = cache
            .messages()
            .iter()
            .filter(|m| m.is_pending())
            .filter(|m| {
                !page
                    .messages
                    .iter()
                    .any(|stored| stored.client_id.is_some() && stored.client_id == m.client_id)
            })
            .cloned()
            .collect();
        let count = page.messages.len();
        cache.reset(page.messages);
        for message in pending {
            cache.append(message);
        }
        Ok(count)
    }

    /// Load the next older page and prepend it to `cache`.
    ///
    /// Returns `Ok(None)` without any network call when a load is already in
    /// flight or nothing older exists, otherwise the number of new messages.
    ///
    /// # Errors
    /// Returns [`ChatError::Load`] on failure; already loaded messages stay.
    pub async fn load_older(
        &mut self,
        backend: &dyn ChatBackend,
        cache: &mut MessageCache,
    ) -> ChatResult<Option<usize>> {
        let Some(page) = self.begin_older() else {
            debug!(scope = %self.scope, loading = self.loading, "Skipping older page load");
            return Ok(None);
        };

        let result = load_page(backend, &self.scope, page, self.page_size).await;
        self.complete(&result);
        let page = result.inspect_err(|err| warn!(scope = %self.scope, page, %err, "Older history load failed"))?;
        Ok(Some(cache.prepend_older(page.messages)))
    }
}
