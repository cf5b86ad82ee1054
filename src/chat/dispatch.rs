//! Outbound message dispatch.
//!
//! A send runs in three steps so the optimistic entry is visible before any
//! network call starts:
//!
//! 1. [`OutboundDispatcher::prepare`] validates, claims the per-conversation
//!    send slot and inserts the optimistic entry.
//! 2. [`OutboundDispatcher::execute`] uploads attachments over REST or emits
//!    text on the realtime channel.
//! 3. [`OutboundDispatcher::finish`] releases the slot and reconciles the
//!    entry, or replaces it with a system notice on failure.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::chat::api::client::ChatBackend;
use crate::chat::cache::MessageCache;
use crate::chat::core::config::AttachmentLimits;
use crate::chat::core::errors::{ChatError, ChatResult, ValidationError};
use crate::chat::core::ids::{ClientMessageId, UserId};
use crate::chat::core::model::{ConversationRef, Message, OutgoingFile, Viewer};
use crate::chat::transport::connection::ConnectionManager;
use crate::chat::transport::events::OutboundEvent;

/// Check a file selection against the attachment bounds.
///
/// # Errors
/// Returns the first bound violated.
pub fn validate_files(
    limits: &AttachmentLimits,
    files: &[OutgoingFile],
) -> Result<(), ValidationError> {
    if files.len() > limits.max_files {
        return Err(ValidationError::TooManyFiles {
            max: limits.max_files,
            got: files.len(),
        });
    }
    if let Some(file) = files.iter().find(|f| f.size() > limits.max_file_bytes) {
        return Err(ValidationError::FileTooLarge {
            filename: file.filename.clone(),
            size: file.size(),
            max: limits.max_file_bytes,
        });
    }
    Ok(())
}

/// A send whose optimistic entry is in the cache.
#[derive(Clone, Debug)]
pub struct PendingSend {
    /// Correlation key of the optimistic entry.
    pub client_id: ClientMessageId,
    /// Target conversation.
    pub scope: ConversationRef,
    /// Text body.
    pub content: String,
    /// Files to upload.
    pub files: Vec<OutgoingFile>,
    /// Customer addressed by a support agent.
    pub receiver_id: Option<UserId>,
}

impl PendingSend {
    /// Whether the send goes through the REST upload path.
    #[must_use]
    pub fn is_upload(&self) -> bool {
        !self.files.is_empty()
    }
}

/// Single-flight sender with optimistic local echo.
#[derive(Debug)]
pub struct OutboundDispatcher {
    viewer: Viewer,
    limits: AttachmentLimits,
    in_flight: HashSet<ConversationRef>,
}

impl OutboundDispatcher {
    /// Create a dispatcher for a viewer.
    #[must_use]
    pub fn new(viewer: Viewer, limits: AttachmentLimits) -> Self {
        Self {
            viewer,
            limits,
            in_flight: HashSet::new(),
        }
    }

    /// Whether a send is in flight for `scope`.
    #[must_use]
    pub fn is_sending(&self, scope: &ConversationRef) -> bool {
        self.in_flight.contains(scope)
    }

    /// Validate the send and insert its optimistic entry.
    ///
    /// Nothing is touched when an error is returned.
    ///
    /// # Errors
    /// Returns [`ChatError::NotConnected`] when the transport is down,
    /// [`ChatError::Validation`] for empty messages or out-of-bounds files, and
    /// [`ChatError::SendInFlight`] while another send for `scope` is running.
    pub fn prepare(
        &mut self,
        scope: &ConversationRef,
        content: &str,
        files: Vec<OutgoingFile>,
        receiver_id: Option<UserId>,
        connected: bool,
        cache: &mut MessageCache,
    ) -> ChatResult<PendingSend> {
        if !connected {
            return Err(ChatError::NotConnected);
        }
        let content = content.trim();
        if content.is_empty() && files.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        validate_files(&self.limits, &files)?;
        if self.in_flight.contains(scope) {
            return Err(ChatError::SendInFlight);
        }

        let client_id = ClientMessageId::new();
        let attachments = files.iter().map(OutgoingFile::to_attachment).collect();
        cache.insert_optimistic(Message::optimistic(
            client_id,
            &self.viewer,
            content,
            attachments,
        ));
        self.in_flight.insert(scope.clone());
        debug!(%scope, %client_id, files = files.len(), "Send prepared");

        Ok(PendingSend {
            client_id,
            scope: scope.clone(),
            content: content.to_string(),
            files,
            receiver_id,
        })
    }

    /// Perform the network part of a send.
    ///
    /// Returns the confirmed record for uploads; realtime sends are confirmed
    /// later by the server echo.
    ///
    /// # Errors
    /// Returns [`ChatError::Send`] if the upload fails, or the transport error
    /// if the realtime emit is refused.
    pub async fn execute(
        pending: &PendingSend,
        backend: &dyn ChatBackend,
        connection: &ConnectionManager,
    ) -> ChatResult<Option<Message>> {
        if pending.is_upload() {
            let confirmed = backend
                .send_with_attachments(
                    &pending.scope,
                    &pending.content,
                    &pending.files,
                    pending.client_id,
                )
                .await
                .map_err(|err| ChatError::Send(err.to_string()))?;
            return Ok(Some(confirmed));
        }

        connection
            .send(OutboundEvent::NewMessage {
                scope: pending.scope.clone(),
                content: pending.content.clone(),
                receiver_id: pending.receiver_id.clone(),
                client_id: pending.client_id,
            })
            .await?;
        Ok(None)
    }

    /// Release the send slot and settle the optimistic entry.
    ///
    /// # Errors
    /// Hands back the failure after replacing the optimistic entry with an
    /// inline system notice.
    pub fn finish(
        &mut self,
        pending: &PendingSend,
        result: ChatResult<Option<Message>>,
        cache: &mut MessageCache,
    ) -> ChatResult<()> {
        self.in_flight.remove(&pending.scope);

        match result {
            Ok(Some(confirmed)) => {
                info!(scope = %pending.scope, id = %confirmed.id, "Upload confirmed");
                cache.reconcile(pending.client_id, confirmed);
                Ok(())
            }
            Ok(None) => {
                debug!(scope = %pending.scope, client_id = %pending.client_id, "Send accepted by transport");
                Ok(())
            }
            Err(err) => {
                warn!(scope = %pending.scope, client_id = %pending.client_id, %err, "Send failed");
                let reason = match &err {
                    ChatError::Send(reason) => reason.clone(),
                    other => other.to_string(),
                };
                cache.remove_pending(pending.client_id);
                cache.append(Message::system_notice(format!(
                    "Failed to send message: {reason}"
                )));
                Err(err)
            }
        }
    }
}
