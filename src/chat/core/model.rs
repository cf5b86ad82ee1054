//! Conversation, message and attachment model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::core::errors::ValidationError;
use crate::chat::core::ids::{ClientMessageId, ConversationId, MessageId, OrderId, UserId};

/// Who authored a message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The marketplace customer.
    #[default]
    #[serde(rename = "user")]
    Customer,
    /// A support agent.
    #[serde(rename = "admin")]
    Support,
    /// Messages generated by the platform or by this client.
    #[serde(rename = "system")]
    System,
}

impl Role {
    /// Stable wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "user",
            Self::Support => "admin",
            Self::System => "system",
        }
    }

    /// Infer the role from a sender id when the backend omits it.
    #[must_use]
    pub fn from_sender_id(sender_id: &str) -> Self {
        if sender_id.starts_with("admin_") {
            Self::Support
        } else if sender_id == "system" {
            Self::System
        } else {
            Self::Customer
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery progress of a message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by this client or the server.
    #[default]
    Sent,
    /// Delivered to the recipient.
    Delivered,
    /// Seen by the recipient.
    Read,
}

/// The authenticated user driving a session.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Viewer {
    /// Account id.
    pub user_id: UserId,
    /// Role the viewer acts in.
    pub role: Role,
}

/// Metadata of a file attached to a message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original file name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Direct URL, absent until the server has processed the file.
    pub url: Option<String>,
}

impl Attachment {
    /// Resolve where the attachment can be downloaded from.
    ///
    /// Uses the direct URL when the server provided one, otherwise the
    /// bearer-authenticated attachment route.
    ///
    /// # Errors
    /// Returns an error if the resulting URL is malformed.
    pub fn download_url(
        &self,
        base: &Url,
        conversation: &str,
        message_id: &MessageId,
        index: usize,
    ) -> Result<Url, url::ParseError> {
        if let Some(direct) = &self.url {
            return base.join(direct);
        }
        base.join(&format!(
            "/chats/v1/{conversation}/messages/{message_id}/attachments/{index}"
        ))
    }
}

/// A file selected for upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutgoingFile {
    /// File name reported to the server.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    /// Create a file selection.
    #[must_use]
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    /// Metadata shown in the optimistic entry before upload completes.
    #[must_use]
    pub fn to_attachment(&self) -> Attachment {
        Attachment {
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            size: self.size(),
            url: None,
        }
    }
}

/// One chat entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server id, or a temporary/local id for client-side entries.
    pub id: MessageId,
    /// Correlation key for optimistic entries, echoed back by the server.
    pub client_id: Option<ClientMessageId>,
    /// Author role.
    pub sender: Role,
    /// Author account, if known.
    pub sender_id: Option<UserId>,
    /// Text body, possibly empty when attachments are present.
    pub content: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Whether the viewer has read it.
    pub read: bool,
    /// Delivery progress.
    pub status: DeliveryStatus,
    /// Attached files.
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Build the optimistic entry shown while a send is in flight.
    #[must_use]
    pub fn optimistic(
        client_id: ClientMessageId,
        viewer: &Viewer,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            id: MessageId::temporary(client_id),
            client_id: Some(client_id),
            sender: viewer.role,
            sender_id: Some(viewer.user_id.clone()),
            content: content.into(),
            timestamp: Utc::now(),
            read: true,
            status: DeliveryStatus::Sent,
            attachments,
        }
    }

    /// Build the inline notice that replaces a failed send.
    #[must_use]
    pub fn system_notice(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            client_id: None,
            sender: Role::System,
            sender_id: None,
            content: content.into(),
            timestamp: Utc::now(),
            read: true,
            status: DeliveryStatus::Sent,
            attachments: Vec::new(),
        }
    }

    /// Whether the entry still awaits server confirmation.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.id.is_temporary()
    }

    /// Snapshot used for conversation list previews.
    #[must_use]
    pub fn preview(&self) -> MessagePreview {
        let content = if self.content.is_empty() && !self.attachments.is_empty() {
            format!("{} attachment(s)", self.attachments.len())
        } else {
            self.content.clone()
        };
        MessagePreview {
            content,
            sender: self.sender,
            timestamp: self.timestamp,
        }
    }
}

/// Last-message snapshot shown in the conversation list.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessagePreview {
    /// Text shown in the list.
    pub content: String,
    /// Author role.
    pub sender: Role,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// How a conversation is addressed on the REST API and the realtime channel.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationRef {
    /// Thread attached to an order.
    Order(OrderId),
    /// Freeform thread.
    Chat(ConversationId),
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order(order_id) => write!(f, "order:{order_id}"),
            Self::Chat(chat_id) => write!(f, "chat:{chat_id}"),
        }
    }
}

/// Discriminant of a conversation and the fields it carries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConversationKind {
    /// Thread attached to an order.
    Order {
        /// The order discussed.
        order_id: OrderId,
    },
    /// Thread opened with a free-text subject.
    Freeform {
        /// Subject line.
        subject: String,
    },
}

/// A support thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server id.
    pub id: ConversationId,
    kind: ConversationKind,
    /// Roles taking part.
    pub participants: Vec<Role>,
    /// Customer account the thread belongs to, if known.
    pub customer_id: Option<UserId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity time.
    pub updated_at: DateTime<Utc>,
    /// Preview of the newest message.
    pub last_message: Option<MessagePreview>,
}

impl Conversation {
    /// Order-scoped conversation.
    #[must_use]
    pub fn for_order(id: ConversationId, order_id: OrderId, created_at: DateTime<Utc>) -> Self {
        Self::with_kind(id, ConversationKind::Order { order_id }, created_at)
    }

    /// Freeform conversation.
    ///
    /// # Errors
    /// Returns an error if the subject is blank.
    pub fn freeform(
        id: ConversationId,
        subject: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let subject = subject.into();
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(ValidationError::EmptySubject);
        }
        Ok(Self::with_kind(
            id,
            ConversationKind::Freeform {
                subject: subject.to_string(),
            },
            created_at,
        ))
    }

    /// Build from the loosely-typed backend shape, enforcing that exactly
    /// one of order id and subject is present.
    ///
    /// # Errors
    /// Returns an error if both or neither are present.
    pub fn from_parts(
        id: ConversationId,
        order_id: Option<OrderId>,
        subject: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let subject = subject.filter(|s| !s.trim().is_empty());
        match (order_id, subject) {
            (Some(order_id), None) => Ok(Self::for_order(id, order_id, created_at)),
            (None, Some(subject)) => Self::freeform(id, subject, created_at),
            (Some(_), Some(_)) => Err(ValidationError::ConversationShape(format!(
                "{id} has both an order and a subject"
            ))),
            (None, None) => Err(ValidationError::ConversationShape(format!(
                "{id} has neither an order nor a subject"
            ))),
        }
    }

    fn with_kind(id: ConversationId, kind: ConversationKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            participants: vec![Role::Customer, Role::Support],
            customer_id: None,
            created_at,
            updated_at: created_at,
            last_message: None,
        }
    }

    /// Discriminant and its fields.
    #[must_use]
    pub const fn kind(&self) -> &ConversationKind {
        &self.kind
    }

    /// Order discussed, for order-scoped threads.
    #[must_use]
    pub const fn order_id(&self) -> Option<&OrderId> {
        match &self.kind {
            ConversationKind::Order { order_id } => Some(order_id),
            ConversationKind::Freeform { .. } => None,
        }
    }

    /// Subject line, for freeform threads.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match &self.kind {
            ConversationKind::Freeform { subject } => Some(subject),
            ConversationKind::Order { .. } => None,
        }
    }

    /// Address used for history, sends and the realtime channel.
    #[must_use]
    pub fn reference(&self) -> ConversationRef {
        match &self.kind {
            ConversationKind::Order { order_id } => ConversationRef::Order(order_id.clone()),
            ConversationKind::Freeform { .. } => ConversationRef::Chat(self.id.clone()),
        }
    }

    /// Whether an event addressed to `scope` belongs to this conversation.
    #[must_use]
    pub fn matches(&self, scope: &ConversationRef) -> bool {
        match scope {
            ConversationRef::Chat(chat_id) => *chat_id == self.id,
            ConversationRef::Order(order_id) => self.order_id() == Some(order_id),
        }
    }

    /// Refresh the preview from a newly seen message.
    pub fn record_message(&mut self, message: &Message) {
        self.last_message = Some(message.preview());
        if message.timestamp > self.updated_at {
            self.updated_at = message.timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer() -> Viewer {
        Viewer {
            user_id: UserId::new("u1"),
            role: Role::Customer,
        }
    }

    #[test]
    fn role_inferred_from_sender_prefix() {
        assert_eq!(Role::from_sender_id("admin_7"), Role::Support);
        assert_eq!(Role::from_sender_id("system"), Role::System);
        assert_eq!(Role::from_sender_id("65ab"), Role::Customer);
    }

    #[test]
    fn role_uses_backend_names_on_the_wire() {
        assert_eq!(serde_json::to_string(&Role::Support).unwrap(), "\"admin\"");
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::Customer);
    }

    #[test]
    fn conversation_requires_exactly_one_discriminant() {
        let now = Utc::now();
        let id = ConversationId::new("c1");
        assert!(Conversation::from_parts(id.clone(), None, None, now).is_err());
        assert!(
            Conversation::from_parts(
                id.clone(),
                Some(OrderId::new("o1")),
                Some("refund".to_string()),
                now
            )
            .is_err()
        );

        let order = Conversation::from_parts(id.clone(), Some(OrderId::new("o1")), None, now).unwrap();
        assert_eq!(order.reference(), ConversationRef::Order(OrderId::new("o1")));
        assert!(order.subject().is_none());

        let freeform = Conversation::from_parts(id.clone(), None, Some("refund".to_string()), now).unwrap();
        assert_eq!(freeform.reference(), ConversationRef::Chat(id));
        assert_eq!(freeform.subject(), Some("refund"));
    }

    #[test]
    fn blank_subject_is_rejected() {
        let err = Conversation::freeform(ConversationId::new("c1"), "   ", Utc::now()).unwrap_err();
        assert_eq!(err, ValidationError::EmptySubject);
    }

    #[test]
    fn optimistic_messages_are_pending() {
        let message = Message::optimistic(ClientMessageId::new(), &viewer(), "hi", Vec::new());
        assert!(message.is_pending());
        assert_eq!(message.status, DeliveryStatus::Sent);
        assert!(!Message::system_notice("failed").is_pending());
    }

    #[test]
    fn attachment_url_falls_back_to_template() {
        let base = Url::parse("https://api.example.test").unwrap();
        let attachment = Attachment {
            filename: "a.png".to_string(),
            content_type: "image/png".to_string(),
            size: 10,
            url: None,
        };
        let url = attachment
            .download_url(&base, "c9", &MessageId::new("m3"), 1)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.test/chats/v1/c9/messages/m3/attachments/1"
        );

        let direct = Attachment {
            url: Some("https://cdn.example.test/a.png".to_string()),
            ..attachment
        };
        let url = direct
            .download_url(&base, "c9", &MessageId::new("m3"), 1)
            .unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.test/a.png");
    }

    #[test]
    fn preview_describes_attachment_only_messages() {
        let file = OutgoingFile::new("a.txt", "text/plain", vec![1, 2, 3]);
        let message = Message::optimistic(
            ClientMessageId::new(),
            &viewer(),
            "",
            vec![file.to_attachment()],
        );
        assert_eq!(message.preview().content, "1 attachment(s)");
    }
}
