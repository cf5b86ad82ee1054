//! In-memory fakes for the backend and connector seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::chat::api::auth::{Account, AuthContext};
use crate::chat::api::client::ChatBackend;
use crate::chat::core::errors::{ApiError, TransportError};
use crate::chat::core::ids::{ClientMessageId, ConversationId, MessageId, OrderId, UserId};
use crate::chat::core::model::{
    Conversation, ConversationRef, DeliveryStatus, Message, OutgoingFile, Role,
};
use crate::chat::transport::events::{InboundEvent, OutboundEvent};
use crate::chat::transport::link::{ConnectRequest, Connector, Link};

pub(crate) fn test_auth() -> AuthContext {
    AuthContext::new(
        "tok",
        Account {
            id: UserId::new("u1"),
            name: Some("Ada".to_string()),
            email: "ada@example.test".to_string(),
            role: Role::Customer,
        },
    )
}

pub(crate) fn agent_auth() -> AuthContext {
    AuthContext::new(
        "agent-tok",
        Account {
            id: UserId::new("admin_1"),
            name: None,
            email: "agent@example.test".to_string(),
            role: Role::Support,
        },
    )
}

/// Server-side message `index` seconds after a fixed origin.
pub(crate) fn server_message(id: &str, content: &str, index: i64) -> Message {
    let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Message {
        id: MessageId::new(id),
        client_id: None,
        sender: Role::Support,
        sender_id: Some(UserId::new("admin_1")),
        content: content.to_string(),
        timestamp: origin + ChronoDuration::seconds(index),
        read: false,
        status: DeliveryStatus::Delivered,
        attachments: Vec::new(),
    }
}

pub(crate) fn order_conversation(id: &str, order_id: &str) -> Conversation {
    Conversation::for_order(ConversationId::new(id), OrderId::new(order_id), Utc::now())
}

#[derive(Default)]
struct BackendState {
    history: HashMap<ConversationRef, Vec<Message>>,
    conversations: Vec<Conversation>,
    calls: Vec<String>,
    fail_history: bool,
    fail_upload: bool,
    next_id: u32,
    marked_read: Vec<OrderId>,
}

/// Backend holding history in memory, oldest first.
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed `count` messages `m0..m{count-1}` for `scope`.
    pub(crate) fn seed_history(&self, scope: &ConversationRef, count: usize) {
        let messages = (0..count)
            .map(|i| server_message(&format!("m{i}"), &format!("message {i}"), i as i64))
            .collect();
        self.state
            .lock()
            .unwrap()
            .history
            .insert(scope.clone(), messages);
    }

    /// Append one stored message to the history of `scope`.
    pub(crate) fn push_history(&self, scope: &ConversationRef, message: Message) {
        self.state
            .lock()
            .unwrap()
            .history
            .entry(scope.clone())
            .or_default()
            .push(message);
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().unwrap().conversations = conversations;
    }

    pub(crate) fn fail_history(&self, fail: bool) {
        self.state.lock().unwrap().fail_history = fail;
    }

    pub(crate) fn fail_upload(&self, fail: bool) {
        self.state.lock().unwrap().fail_upload = fail;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn marked_read(&self) -> Vec<OrderId> {
        self.state.lock().unwrap().marked_read.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn confirmed(&self, content: &str, client_id: ClientMessageId, files: &[OutgoingFile]) -> Message {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        Message {
            id: MessageId::new(format!("srv-{}", state.next_id)),
            client_id: Some(client_id),
            sender: Role::Customer,
            sender_id: Some(UserId::new("u1")),
            content: content.to_string(),
            timestamp: Utc::now(),
            read: false,
            status: DeliveryStatus::Delivered,
            attachments: files
                .iter()
                .enumerate()
                .map(|(i, file)| {
                    let mut attachment = file.to_attachment();
                    attachment.url = Some(format!("https://cdn.example.test/{i}/{}", file.filename));
                    attachment
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_history(
        &self,
        scope: &ConversationRef,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        self.record(format!("history {scope} page={page} limit={limit}"));
        let state = self.state.lock().unwrap();
        if state.fail_history {
            return Err(ApiError::Status {
                status: 503,
                message: "history unavailable".to_string(),
            });
        }
        let all = state.history.get(scope).cloned().unwrap_or_default();
        let limit = limit as usize;
        let skip = (page.saturating_sub(1) as usize) * limit;
        let end = all.len().saturating_sub(skip);
        let start = end.saturating_sub(limit);
        // newest first, the way the backend sorts
        Ok(all[start..end].iter().rev().cloned().collect())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        self.record("list".to_string());
        Ok(self.state.lock().unwrap().conversations.clone())
    }

    async fn create_conversation(
        &self,
        subject: &str,
        message: &str,
    ) -> Result<Conversation, ApiError> {
        self.record(format!("create {subject}"));
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = ConversationId::new(format!("chat-{}", state.next_id));
        let conversation = Conversation::freeform(id.clone(), subject, Utc::now())?;
        let first = server_message(&format!("first-{}", state.next_id), message, 0);
        state
            .history
            .insert(ConversationRef::Chat(id), vec![first]);
        state.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn send_with_attachments(
        &self,
        scope: &ConversationRef,
        content: &str,
        files: &[OutgoingFile],
        client_id: ClientMessageId,
    ) -> Result<Message, ApiError> {
        self.record(format!("upload {scope} files={}", files.len()));
        if self.state.lock().unwrap().fail_upload {
            return Err(ApiError::Status {
                status: 413,
                message: "upload rejected".to_string(),
            });
        }
        Ok(self.confirmed(content, client_id, files))
    }

    async fn mark_all_read(&self, order_id: &OrderId) -> Result<(), ApiError> {
        self.record(format!("read {order_id}"));
        self.state.lock().unwrap().marked_read.push(order_id.clone());
        Ok(())
    }

    async fn fetch_attachment(
        &self,
        conversation: &str,
        message_id: &MessageId,
        index: usize,
    ) -> Result<Vec<u8>, ApiError> {
        self.record(format!("attachment {conversation}/{message_id}/{index}"));
        Ok(vec![0xde, 0xad])
    }
}

#[derive(Default)]
struct ConnectorState {
    failures_left: u32,
    reject: Option<String>,
    hang: bool,
    sent: Vec<OutboundEvent>,
    requests: Vec<ConnectRequest>,
    current: Option<mpsc::UnboundedSender<InboundEvent>>,
}

/// Connector handing out in-memory links.
#[derive(Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    connects: AtomicU32,
    closed: Arc<AtomicU32>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `failures` connection attempts.
    pub(crate) fn failing(failures: u32) -> Arc<Self> {
        let connector = Self::default();
        connector.state.lock().unwrap().failures_left = failures;
        Arc::new(connector)
    }

    /// Refuse every handshake with `reason`.
    pub(crate) fn rejecting(reason: &str) -> Arc<Self> {
        let connector = Self::default();
        connector.state.lock().unwrap().reject = Some(reason.to_string());
        Arc::new(connector)
    }

    /// Never complete a connection attempt.
    pub(crate) fn hanging() -> Arc<Self> {
        let connector = Self::default();
        connector.state.lock().unwrap().hang = true;
        Arc::new(connector)
    }

    pub(crate) fn sent(&self) -> Vec<OutboundEvent> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(OutboundEvent::name).collect()
    }

    pub(crate) fn requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub(crate) fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver a server event on the current link.
    pub(crate) fn push(&self, event: InboundEvent) {
        if let Some(tx) = &self.state.lock().unwrap().current {
            tx.send(event).unwrap();
        }
    }

    /// Simulate a network loss of the current link.
    pub(crate) fn drop_link(&self) {
        self.state.lock().unwrap().current = None;
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Link>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let hang = self.state.lock().unwrap().hang;
        if hang {
            return std::future::pending().await;
        }
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if let Some(reason) = &state.reject {
            return Err(TransportError::Rejected(reason.clone()));
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TransportError::Protocol("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(Box::new(MockLink {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            inbound: rx,
        }))
    }
}

struct MockLink {
    state: Arc<Mutex<ConnectorState>>,
    closed: Arc<AtomicU32>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError> {
        self.state.lock().unwrap().sent.push(event.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
