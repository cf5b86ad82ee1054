//! Chat session controller.
//!
//! Ties the connection manager, history loader, dispatcher, typing tracker
//! and conversation directory to one viewer. All state lives behind
//! `&mut self`; transport events are consumed through [`ChatSession::next_event`].

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::chat::api::auth::AuthContext;
use crate::chat::api::client::ChatBackend;
use crate::chat::cache::MessageCache;
use crate::chat::core::config::ChatConfig;
use crate::chat::core::errors::{ChatError, ChatResult, ValidationError};
use crate::chat::core::ids::{ConversationId, MessageId, OrderId, UserId};
use crate::chat::core::model::{
    Conversation, ConversationRef, DeliveryStatus, Message, OutgoingFile, Role, Viewer,
};
use crate::chat::directory::ConversationDirectory;
use crate::chat::dispatch::{OutboundDispatcher, validate_files};
use crate::chat::history::HistoryLoader;
use crate::chat::transport::connection::{ConnectionManager, ConnectionState};
use crate::chat::transport::events::{OutboundEvent, TransportEvent};
use crate::chat::transport::link::Connector;
use crate::chat::transport::subscription::Subscription;
use crate::chat::typing::{RemoteTyping, TypingSignal, TypingTracker};

/// What changed after a call to [`ChatSession::next_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected for the first time.
    Connected,
    /// Connection restored; the handshake has been re-issued.
    Reconnected {
        /// Attempts it took.
        attempt: u32,
    },
    /// A connection attempt failed; retries continue.
    ConnectError(String),
    /// The connection dropped.
    Disconnected {
        /// Human-readable reason.
        reason: String,
        /// Whether retries are exhausted.
        gave_up: bool,
    },
    /// Credentials were rejected.
    AuthFailed(String),
    /// A message arrived.
    Message {
        /// Server id.
        id: MessageId,
        /// Whether it landed in the open conversation.
        in_active: bool,
    },
    /// The set of remote typists changed.
    RemoteTyping,
    /// A message's delivery status changed.
    Status {
        /// Message concerned.
        id: MessageId,
        /// New status.
        status: DeliveryStatus,
    },
    /// The local typing state lapsed after inactivity.
    TypingStopped,
}

/// One viewer's chat session.
pub struct ChatSession {
    config: ChatConfig,
    viewer: Viewer,
    backend: Arc<dyn ChatBackend>,
    connection: ConnectionManager,
    events: Subscription,
    directory: ConversationDirectory,
    history: Option<HistoryLoader>,
    dispatcher: OutboundDispatcher,
    typing: TypingTracker,
    remote_typing: RemoteTyping,
    draft: String,
    selected_files: Vec<OutgoingFile>,
    /// Last connection epoch of the previous scope.
    replaced_epoch: u64,
}

impl ChatSession {
    /// Create a session; nothing is opened yet.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: ChatConfig,
        auth: AuthContext,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn Connector>,
    ) -> ChatResult<Self> {
        config.validate()?;
        let viewer = auth.viewer();
        let connection = ConnectionManager::new(connector, config.realtime.clone(), auth);
        let events = connection.subscribe();

        Ok(Self {
            directory: ConversationDirectory::new(config.cache_capacity)?,
            dispatcher: OutboundDispatcher::new(viewer.clone(), config.attachments),
            typing: TypingTracker::new(config.typing.inactivity),
            remote_typing: RemoteTyping::new(viewer.user_id.clone()),
            viewer,
            backend,
            connection,
            events,
            history: None,
            draft: String::new(),
            selected_files: Vec::new(),
            replaced_epoch: 0,
            config,
        })
    }

    /// Open the thread of one order.
    ///
    /// `customer_id` is the order's owner, used as receiver when the viewer
    /// is a support agent.
    ///
    /// # Errors
    /// Returns [`ChatError::Load`] if the first page cannot be fetched; the
    /// session stays usable and the connection keeps running.
    pub async fn open_order(
        &mut self,
        order_id: OrderId,
        customer_id: Option<UserId>,
    ) -> ChatResult<()> {
        let mut conversation = Conversation::for_order(
            ConversationId::new(order_id.as_str()),
            order_id,
            chrono::Utc::now(),
        );
        conversation.customer_id = customer_id;
        let id = conversation.id.clone();
        self.directory.upsert(conversation);
        self.activate(&id).await
    }

    /// Open the conversation list and the first conversation, if any.
    ///
    /// # Errors
    /// Returns an error if the list or the first page cannot be fetched.
    pub async fn open_inbox(&mut self) -> ChatResult<()> {
        self.directory.refresh(&*self.backend).await?;
        match self.directory.active_conversation().map(|c| c.id.clone()) {
            Some(id) => self.activate(&id).await,
            None => {
                info!("No conversation yet; connecting without scope");
                self.connection.open(None).await;
                Ok(())
            }
        }
    }

    /// Switch to another listed conversation.
    ///
    /// Re-scopes the connection and reloads page 1; the previous
    /// conversation's cache is kept.
    ///
    /// # Errors
    /// Returns an error if the conversation is not listed or its first page
    /// cannot be fetched.
    pub async fn switch(&mut self, id: &ConversationId) -> ChatResult<()> {
        if self.directory.get(id).is_none() {
            return Err(ChatError::NoActiveConversation);
        }
        if let Some(signal) = self.typing.force_idle() {
            self.emit_typing(signal).await;
        }
        self.activate(id).await
    }

    /// Start a freeform conversation and open it.
    ///
    /// # Errors
    /// Returns a validation error for a blank subject or message, or the
    /// backend error.
    pub async fn create_conversation(
        &mut self,
        subject: &str,
        message: &str,
    ) -> ChatResult<ConversationId> {
        if subject.trim().is_empty() {
            return Err(ValidationError::EmptySubject.into());
        }
        if message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let conversation = self
            .backend
            .create_conversation(subject.trim(), message.trim())
            .await?;
        let id = conversation.id.clone();
        info!(conversation_id = %id, "Conversation created");
        self.directory.upsert(conversation);
        self.switch(&id).await?;
        Ok(id)
    }

    async fn activate(&mut self, id: &ConversationId) -> ChatResult<()> {
        let scope = self.directory.select(id)?;
        self.remote_typing.clear();
        if self.connection.scope() != Some(&scope) {
            self.replaced_epoch = self.connection.state().epoch;
        }
        self.connection.open(Some(scope.clone())).await;

        let mut loader = HistoryLoader::new(scope, self.config.history.page_size);
        let result = match self.directory.active_cache_mut() {
            Some(cache) => loader.load_first(&*self.backend, cache).await,
            None => Err(ChatError::NoActiveConversation),
        };
        self.history = Some(loader);
        result.map(|count| debug!(count, "First page merged"))
    }

    /// Authenticated viewer.
    #[must_use]
    pub const fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    /// Messages of the open conversation, in display order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.directory
            .active_cache()
            .map(MessageCache::messages)
            .unwrap_or_default()
    }

    /// Visible conversations.
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        self.directory.conversations()
    }

    /// The open conversation.
    #[must_use]
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.directory.active_conversation()
    }

    /// Connection state snapshot.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether the send control should be enabled.
    #[must_use]
    pub fn can_send(&self) -> bool {
        let sending = self
            .active_scope()
            .is_some_and(|scope| self.dispatcher.is_sending(&scope));
        self.connection.is_connected() && !sending
    }

    /// Remote participants typing in the open conversation.
    #[must_use]
    pub const fn remote_typing(&self) -> &RemoteTyping {
        &self.remote_typing
    }

    /// Whether the local user is typing.
    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.typing.is_typing()
    }

    /// Whether an older page may exist.
    #[must_use]
    pub fn has_more_history(&self) -> bool {
        self.history.as_ref().is_some_and(HistoryLoader::has_more)
    }

    /// Compose input.
    #[must_use]
    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Files selected for the next send.
    #[must_use]
    pub fn selected_files(&self) -> &[OutgoingFile] {
        &self.selected_files
    }

    fn active_scope(&self) -> Option<ConversationRef> {
        self.directory
            .active_conversation()
            .map(Conversation::reference)
    }

    /// Replace the file selection.
    ///
    /// # Errors
    /// Returns the bound violated; the current selection is kept.
    pub fn select_files(&mut self, files: Vec<OutgoingFile>) -> Result<(), ValidationError> {
        validate_files(&self.config.attachments, &files)?;
        self.selected_files = files;
        Ok(())
    }

    /// Drop the file selection.
    pub fn clear_files(&mut self) {
        self.selected_files.clear();
    }

    /// Update the compose input and the typing state.
    pub async fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
        let non_empty = !self.draft.trim().is_empty();
        if let Some(signal) = self.typing.on_input(Instant::now(), non_empty) {
            self.emit_typing(signal).await;
        }
    }

    /// The compose input lost focus.
    pub async fn blur(&mut self) {
        if let Some(signal) = self.typing.force_idle() {
            self.emit_typing(signal).await;
        }
    }

    async fn emit_typing(&self, signal: TypingSignal) {
        let Some(scope) = self.active_scope() else {
            return;
        };
        if !self.connection.is_connected() {
            return;
        }
        let event = OutboundEvent::Typing {
            scope,
            is_typing: signal.is_typing(),
        };
        if let Err(err) = self.connection.send(event).await {
            debug!(%err, ?signal, "Typing signal not delivered");
        }
    }

    /// Send the draft and selected files.
    ///
    /// The optimistic entry is in [`Self::messages`] before any network call;
    /// the draft, the selection and the typing state are cleared once the
    /// send is accepted.
    ///
    /// # Errors
    /// Returns [`ChatError::NotConnected`], a validation error or
    /// [`ChatError::SendInFlight`] without touching anything, or the send
    /// failure after the optimistic entry was replaced by a notice.
    pub async fn send(&mut self) -> ChatResult<()> {
        let conversation = self
            .directory
            .active_conversation()
            .ok_or(ChatError::NoActiveConversation)?;
        let scope = conversation.reference();
        let receiver_id = match self.viewer.role {
            Role::Support => conversation.customer_id.clone(),
            Role::Customer | Role::System => None,
        };
        let connected = self.connection.is_connected();

        let cache = self
            .directory
            .active_cache_mut()
            .ok_or(ChatError::NoActiveConversation)?;
        let pending = self.dispatcher.prepare(
            &scope,
            &self.draft,
            self.selected_files.clone(),
            receiver_id,
            connected,
            cache,
        )?;

        self.draft.clear();
        self.selected_files.clear();
        if let Some(signal) = self.typing.force_idle() {
            self.emit_typing(signal).await;
        }

        let result =
            OutboundDispatcher::execute(&pending, &*self.backend, &self.connection).await;
        let cache = self
            .directory
            .active_cache_mut()
            .ok_or(ChatError::NoActiveConversation)?;
        self.dispatcher.finish(&pending, result, cache)
    }

    /// Load the next older page of the open conversation.
    ///
    /// Returns `Ok(None)` when a load is in flight or nothing older exists.
    ///
    /// # Errors
    /// Returns [`ChatError::Load`]; loaded messages are kept.
    pub async fn load_older(&mut self) -> ChatResult<Option<usize>> {
        let loader = self
            .history
            .as_mut()
            .ok_or(ChatError::NoActiveConversation)?;
        let cache = self
            .directory
            .active_cache_mut()
            .ok_or(ChatError::NoActiveConversation)?;
        loader.load_older(&*self.backend, cache).await
    }

    /// Mark the open conversation read.
    ///
    /// Order threads are marked on the backend; the local flags are flipped
    /// in every case.
    ///
    /// # Errors
    /// Returns the backend error; local flags are then left unchanged.
    pub async fn mark_all_read(&mut self) -> ChatResult<()> {
        let scope = self.active_scope().ok_or(ChatError::NoActiveConversation)?;
        if let ConversationRef::Order(order_id) = &scope {
            self.backend.mark_all_read(order_id).await?;
        }
        if let Some(cache) = self.directory.active_cache_mut() {
            cache.mark_all_read();
        }
        info!(%scope, "Conversation marked read");
        Ok(())
    }

    /// Report one displayed message as read.
    ///
    /// # Errors
    /// Returns an error if the message is unknown or the event cannot be sent.
    pub async fn mark_read(&mut self, id: &MessageId) -> ChatResult<()> {
        let scope = self.active_scope().ok_or(ChatError::NoActiveConversation)?;
        let cache = self
            .directory
            .active_cache_mut()
            .ok_or(ChatError::NoActiveConversation)?;
        if !cache.apply_status(id, DeliveryStatus::Read) {
            return Err(ChatError::Send(format!("unknown message {id}")));
        }
        if let ConversationRef::Order(order_id) = scope {
            self.connection
                .send(OutboundEvent::MessageRead {
                    order_id,
                    message_id: id.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Where an attachment of the open conversation can be downloaded.
    ///
    /// # Errors
    /// Returns an error if the message or attachment is unknown.
    pub fn attachment_url(&self, id: &MessageId, index: usize) -> ChatResult<Url> {
        let conversation = self
            .directory
            .active_conversation()
            .ok_or(ChatError::NoActiveConversation)?;
        let attachment = self
            .messages()
            .iter()
            .find(|m| &m.id == id)
            .and_then(|m| m.attachments.get(index))
            .ok_or_else(|| ChatError::Send(format!("no attachment {index} on {id}")))?;
        let base = Url::parse(&self.config.api.base_url)
            .map_err(|e| ChatError::Config(format!("api.base_url: {e}")))?;
        attachment
            .download_url(&base, conversation.id.as_str(), id, index)
            .map_err(|e| ChatError::Config(format!("attachment url: {e}")))
    }

    /// Download an attachment of the open conversation.
    ///
    /// # Errors
    /// Returns the backend error.
    pub async fn download_attachment(&self, id: &MessageId, index: usize) -> ChatResult<Vec<u8>> {
        let conversation = self
            .directory
            .active_conversation()
            .ok_or(ChatError::NoActiveConversation)?;
        Ok(self
            .backend
            .fetch_attachment(conversation.id.as_str(), id, index)
            .await?)
    }

    /// Wait for the next transport event or typing timeout and apply it.
    ///
    /// Returns `None` once the event stream has ended.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let deadline = self.typing.next_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(applied) = self.apply(event) {
                            return Some(applied);
                        }
                    }
                    None => return None,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(signal) = self.typing.poll_expired(Instant::now()) {
                        self.emit_typing(signal).await;
                        return Some(SessionEvent::TypingStopped);
                    }
                }
            }
        }
    }

    /// Apply a transport event to the session state.
    ///
    /// Returns `None` for a message without a stated scope that arrived on a
    /// connection of a previously open conversation; it is dropped.
    pub fn apply(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        if matches!(
            &event,
            TransportEvent::Message { scope: None, epoch, .. } if *epoch <= self.replaced_epoch
        ) {
            debug!(
                replaced_epoch = self.replaced_epoch,
                "Dropping unscoped message from a replaced connection"
            );
            return None;
        }
        Some(match event {
            TransportEvent::Connected { .. } => SessionEvent::Connected,
            TransportEvent::Reconnected { attempt, .. } => {
                self.remote_typing.clear();
                SessionEvent::Reconnected { attempt }
            }
            TransportEvent::ConnectError(reason) => SessionEvent::ConnectError(reason),
            TransportEvent::Disconnected { reason, gave_up } => {
                self.remote_typing.clear();
                self.typing.force_idle();
                SessionEvent::Disconnected { reason, gave_up }
            }
            TransportEvent::AuthFailed(reason) => {
                warn!(%reason, "Chat credentials rejected");
                SessionEvent::AuthFailed(reason)
            }
            TransportEvent::Message { scope, message, .. } => {
                let id = message.id.clone();
                let routed = self.directory.route_message(scope.as_ref(), *message);
                SessionEvent::Message {
                    id,
                    in_active: routed.active.is_some(),
                }
            }
            TransportEvent::Typing {
                user_id,
                is_typing,
                scope,
            } => {
                let relevant = match (&scope, self.directory.active_conversation()) {
                    (Some(scope), Some(active)) => active.matches(scope),
                    (None, _) => true,
                    (Some(_), None) => false,
                };
                if relevant {
                    self.remote_typing.apply(user_id, is_typing);
                }
                SessionEvent::RemoteTyping
            }
            TransportEvent::StatusUpdate { message_id, status } => {
                if let Some(cache) = self.directory.active_cache_mut() {
                    cache.apply_status(&message_id, status);
                }
                SessionEvent::Status {
                    id: message_id,
                    status,
                }
            }
        })
    }

    /// Tear down: stop typing, leave the conversation, close the connection.
    pub async fn close(mut self) {
        if let Some(signal) = self.typing.force_idle() {
            self.emit_typing(signal).await;
        }
        if let Some(scope) = self.active_scope() {
            if self.connection.is_connected() {
                if let Err(err) = self.connection.send(OutboundEvent::Leave(scope)).await {
                    debug!(%err, "Leave not delivered");
                }
            }
        }
        self.connection.close().await;
        info!("Chat session closed");
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("viewer", &self.viewer)
            .field("connection", &self.connection)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::chat::core::ids::ClientMessageId;
    use crate::chat::testing::{
        FakeBackend, MockConnector, agent_auth, order_conversation, server_message, test_auth,
    };
    use crate::chat::transport::events::InboundEvent;
    use crate::chat::core::model::ConversationKind;

    fn order_scope() -> ConversationRef {
        ConversationRef::Order(OrderId::new("o1"))
    }

    fn new_session(
        backend: &Arc<FakeBackend>,
        connector: &Arc<MockConnector>,
        auth: AuthContext,
    ) -> ChatSession {
        ChatSession::new(ChatConfig::default(), auth, backend.clone(), connector.clone()).unwrap()
    }

    async fn wait_for(session: &mut ChatSession, wanted: fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), session.next_event())
                .await
                .unwrap()
                .unwrap();
            if wanted(&event) {
                return event;
            }
        }
    }

    async fn connected_order_session(
        backend: &Arc<FakeBackend>,
        connector: &Arc<MockConnector>,
    ) -> ChatSession {
        let mut session = new_session(backend, connector, test_auth());
        session.open_order(OrderId::new("o1"), None).await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;
        session
    }

    fn last_client_id(connector: &MockConnector) -> ClientMessageId {
        connector
            .sent()
            .iter()
            .rev()
            .find_map(|event| match event {
                OutboundEvent::NewMessage { client_id, .. } => Some(*client_id),
                _ => None,
            })
            .unwrap()
    }

    fn echo(id: &str, client_id: Option<ClientMessageId>, content: &str, order: &str) -> InboundEvent {
        InboundEvent::Message(Box::new(
            serde_json::from_value(json!({
                "_id": id,
                "clientId": client_id.map(|c| c.to_string()),
                "senderId": "u1",
                "content": content,
                "orderId": order,
            }))
            .unwrap(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_sends_reconcile_without_duplicates() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;

        for i in 0..3 {
            session.set_draft(format!("message {i}")).await;
            session.send().await.unwrap();

            assert_eq!(session.messages().len(), i + 1);
            assert!(session.messages()[i].is_pending());
            assert_eq!(session.messages()[i].status, DeliveryStatus::Sent);
            assert!(session.draft().is_empty());

            let client_id = last_client_id(&connector);
            connector.push(echo(&format!("srv-{i}"), Some(client_id), &format!("message {i}"), "o1"));
            let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Message { .. })).await;
            assert_eq!(
                event,
                SessionEvent::Message {
                    id: MessageId::new(format!("srv-{i}")),
                    in_active: true
                }
            );
        }

        let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-0", "srv-1", "srv-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_touches_nothing() {
        let backend = FakeBackend::new();
        let connector = MockConnector::failing(u32::MAX);
        let mut session = new_session(&backend, &connector, test_auth());
        session.open_order(OrderId::new("o1"), None).await.unwrap();
        session.set_draft("hello").await;
        session
            .select_files(vec![OutgoingFile::new("a.txt", "text/plain", vec![1])])
            .unwrap();

        let err = session.send().await.unwrap_err();
        assert!(matches!(err, ChatError::NotConnected));
        assert!(session.messages().is_empty());
        assert_eq!(session.draft(), "hello");
        assert_eq!(session.selected_files().len(), 1);
        assert!(!session.can_send());
        assert!(backend.calls().iter().all(|call| !call.starts_with("upload")));
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn invalid_selection_keeps_previous_files() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, test_auth());
        let keep = vec![OutgoingFile::new("a.txt", "text/plain", vec![1])];
        session.select_files(keep.clone()).unwrap();

        let four = (0..4)
            .map(|i| OutgoingFile::new(format!("{i}.txt"), "text/plain", vec![1]))
            .collect();
        assert!(matches!(
            session.select_files(four),
            Err(ValidationError::TooManyFiles { .. })
        ));
        let huge = vec![OutgoingFile::new("big.bin", "application/octet-stream", vec![0; 5 * 1024 * 1024 + 1])];
        assert!(matches!(
            session.select_files(huge),
            Err(ValidationError::FileTooLarge { .. })
        ));
        assert_eq!(session.selected_files(), keep.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn older_pages_are_prepended() {
        let backend = FakeBackend::new();
        backend.seed_history(&order_scope(), 70);
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;

        assert_eq!(session.messages().len(), 50);
        let page_one: Vec<_> = session.messages().to_vec();
        assert!(session.has_more_history());

        assert_eq!(session.load_older().await.unwrap(), Some(20));
        assert_eq!(session.messages().len(), 70);
        assert_eq!(&session.messages()[20..], page_one.as_slice());
        assert!(session.messages().windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(!session.has_more_history());
    }

    #[tokio::test(start_paused = true)]
    async fn send_right_after_reconnect_succeeds() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;

        connector.drop_link();
        wait_for(&mut session, |e| matches!(e, SessionEvent::Disconnected { gave_up: false, .. })).await;
        wait_for(&mut session, |e| matches!(e, SessionEvent::Reconnected { .. })).await;

        session.set_draft("back again").await;
        session.send().await.unwrap();

        let names = connector.sent_names();
        assert_eq!(names.iter().filter(|n| **n == "authenticate").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "join-order-chat").count(), 2);
        assert_eq!(names.last(), Some(&"new-message"));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_is_debounced() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;

        session.set_draft("h").await;
        tokio::time::advance(Duration::from_millis(30)).await;
        session.set_draft("he").await;
        tokio::time::advance(Duration::from_millis(30)).await;
        session.set_draft("hel").await;

        let started = Instant::now();
        assert_eq!(
            wait_for(&mut session, |e| *e == SessionEvent::TypingStopped).await,
            SessionEvent::TypingStopped
        );
        assert!(started.elapsed() >= Duration::from_millis(3000));

        let typing: Vec<bool> = connector
            .sent()
            .iter()
            .filter_map(|event| match event {
                OutboundEvent::Typing { is_typing, .. } => Some(*is_typing),
                _ => None,
            })
            .collect();
        assert_eq!(typing, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_conversation_updates_preview_only() {
        let backend = FakeBackend::new();
        backend.set_conversations(vec![order_conversation("a", "oa"), order_conversation("b", "ob")]);
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, test_auth());
        session.open_inbox().await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;
        assert_eq!(session.active_conversation().unwrap().id.as_str(), "a");

        connector.push(echo("m-b", None, "for b", "ob"));
        let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Message { .. })).await;

        assert_eq!(
            event,
            SessionEvent::Message {
                id: MessageId::new("m-b"),
                in_active: false
            }
        );
        assert!(session.messages().is_empty());
        let b = session
            .conversations()
            .iter()
            .find(|c| c.id.as_str() == "b")
            .unwrap();
        assert_eq!(b.last_message.as_ref().unwrap().content, "for b");
    }

    #[tokio::test(start_paused = true)]
    async fn switching_rescopes_connection() {
        let backend = FakeBackend::new();
        backend.set_conversations(vec![order_conversation("a", "oa"), order_conversation("b", "ob")]);
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, test_auth());
        session.open_inbox().await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;

        session.switch(&ConversationId::new("b")).await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;

        let requests = connector.requests();
        assert_eq!(
            requests.last().unwrap().scope,
            Some(ConversationRef::Order(OrderId::new("ob")))
        );
        assert_eq!(connector.closed_count(), 1);
        assert!(backend.calls().contains(&"history order:ob page=1 limit=50".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_back_after_background_echo_shows_message_once() {
        let backend = FakeBackend::new();
        backend.set_conversations(vec![order_conversation("a", "oa"), order_conversation("b", "ob")]);
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, test_auth());
        session.open_inbox().await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;

        session.set_draft("hello").await;
        session.send().await.unwrap();
        let client_id = last_client_id(&connector);

        session.switch(&ConversationId::new("b")).await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;
        connector.push(echo("srv-9", Some(client_id), "hello", "oa"));
        let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Message { .. })).await;
        assert_eq!(
            event,
            SessionEvent::Message {
                id: MessageId::new("srv-9"),
                in_active: false
            }
        );

        let mut stored = server_message("srv-9", "hello", 1);
        stored.client_id = Some(client_id);
        backend.push_history(&ConversationRef::Order(OrderId::new("oa")), stored);
        session.switch(&ConversationId::new("a")).await.unwrap();

        let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unscoped_message_from_previous_connection_is_dropped() {
        let backend = FakeBackend::new();
        backend.set_conversations(vec![order_conversation("a", "oa"), order_conversation("b", "ob")]);
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, test_auth());
        session.open_inbox().await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;

        let unscoped = |id: &str| {
            InboundEvent::Message(Box::new(
                serde_json::from_value(json!({ "_id": id, "senderId": "admin_1", "content": id }))
                    .unwrap(),
            ))
        };
        connector.push(unscoped("m-old"));
        // queued by the old connection, not yet applied
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.switch(&ConversationId::new("b")).await.unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;
        connector.push(unscoped("m-new"));
        let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Message { .. })).await;

        assert_eq!(
            event,
            SessionEvent::Message {
                id: MessageId::new("m-new"),
                in_active: true
            }
        );
        let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-new"]);
        let a = session
            .conversations()
            .iter()
            .find(|c| c.id.as_str() == "a")
            .unwrap();
        assert!(a.last_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn create_conversation_opens_it() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, test_auth());
        session.open_inbox().await.unwrap();

        let id = session.create_conversation("Refund", "Where is my refund?").await.unwrap();
        let active = session.active_conversation().unwrap();
        assert_eq!(active.id, id);
        assert!(matches!(active.kind(), ConversationKind::Freeform { subject } if subject == "Refund"));
        assert_eq!(session.messages().len(), 1);

        assert!(matches!(
            session.create_conversation("  ", "hi").await,
            Err(ChatError::Validation(ValidationError::EmptySubject))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_messages_address_the_customer() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = new_session(&backend, &connector, agent_auth());
        session
            .open_order(OrderId::new("o1"), Some(UserId::new("u1")))
            .await
            .unwrap();
        wait_for(&mut session, |e| *e == SessionEvent::Connected).await;

        session.set_draft("How can I help?").await;
        session.send().await.unwrap();

        let receiver = connector.sent().iter().rev().find_map(|event| match event {
            OutboundEvent::NewMessage { receiver_id, .. } => receiver_id.clone(),
            _ => None,
        });
        assert_eq!(receiver, Some(UserId::new("u1")));
        assert_eq!(session.messages()[0].sender, Role::Support);
    }

    #[tokio::test(start_paused = true)]
    async fn read_tracking() {
        let backend = FakeBackend::new();
        backend.seed_history(&order_scope(), 2);
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;

        session.mark_read(&MessageId::new("m1")).await.unwrap();
        assert_eq!(connector.sent_names().last(), Some(&"message-read"));

        connector.push(InboundEvent::StatusUpdate {
            message_id: MessageId::new("m0"),
            status: DeliveryStatus::Read,
        });
        wait_for(&mut session, |e| matches!(e, SessionEvent::Status { .. })).await;
        assert!(session.messages().iter().all(|m| m.read));

        session.mark_all_read().await.unwrap();
        assert_eq!(backend.marked_read(), vec![OrderId::new("o1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_typing_and_leaves() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;
        session.set_draft("half a thought").await;

        session.close().await;

        let names = connector.sent_names();
        let tail = &names[names.len() - 3..];
        assert_eq!(tail, &["typing", "typing", "leave-order-chat"]);
        assert_eq!(connector.closed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_typing_from_viewer_is_ignored() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;

        connector.push(InboundEvent::Typing {
            user_id: UserId::new("u1"),
            is_typing: true,
            scope: Some(order_scope()),
        });
        connector.push(InboundEvent::Typing {
            user_id: UserId::new("admin_1"),
            is_typing: true,
            scope: Some(order_scope()),
        });
        wait_for(&mut session, |e| *e == SessionEvent::RemoteTyping).await;
        wait_for(&mut session, |e| *e == SessionEvent::RemoteTyping).await;

        let typists: Vec<_> = session.remote_typing().users().map(UserId::as_str).collect();
        assert_eq!(typists, vec!["admin_1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn attachment_links_and_downloads() {
        let backend = FakeBackend::new();
        let connector = MockConnector::new();
        let mut session = connected_order_session(&backend, &connector).await;
        session
            .select_files(vec![OutgoingFile::new("r.pdf", "application/pdf", vec![1, 2])])
            .unwrap();
        session.send().await.unwrap();

        let id = session.messages()[0].id.clone();
        let url = session.attachment_url(&id, 0).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.test/0/r.pdf");
        assert_eq!(session.download_attachment(&id, 0).await.unwrap(), vec![0xde, 0xad]);
        assert!(session.attachment_url(&id, 5).is_err());
    }
}
