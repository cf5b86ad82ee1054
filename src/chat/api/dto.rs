//! Wire shapes exchanged with the chat backend.
//!
//! The backend is loosely typed (Mongo documents, camelCase keys, a few
//! legacy envelope names), so decoding is lenient here and the strict model
//! types are built from these DTOs.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::chat::core::errors::ValidationError;
use crate::chat::core::ids::{ClientMessageId, ConversationId, MessageId, OrderId, UserId};
use crate::chat::core::model::{
    Attachment, Conversation, ConversationRef, DeliveryStatus, Message, Role,
};

/// A message as sent by the backend, over REST or the realtime channel.
///
/// Decoding accepts either spelling of the aliased keys (`_id`/`id`,
/// `timestamp`/`createdAt`, `sender`/`senderRole`), including documents that
/// carry both; the first spelling listed wins.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Server id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Echoed client correlation key.
    pub client_id: Option<String>,
    /// Author account.
    pub sender_id: Option<String>,
    /// Author role, when the backend states it.
    pub sender: Option<Role>,
    /// Text body.
    pub content: String,
    /// Creation time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Read flag.
    pub read: bool,
    /// Delivery status.
    pub status: Option<DeliveryStatus>,
    /// Attachment metadata.
    pub attachments: Vec<WireAttachment>,
    /// Order scope, for order-scoped threads.
    pub order_id: Option<String>,
    /// Conversation scope, for freeform threads.
    pub chat_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default, rename = "_id")]
    mongo_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    sender: Option<Role>,
    #[serde(default)]
    sender_role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    status: Option<DeliveryStatus>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
}

impl<'de> Deserialize<'de> for WireMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawMessage::deserialize(deserializer)?;
        let id = raw
            .mongo_id
            .or(raw.id)
            .ok_or_else(|| de::Error::missing_field("_id"))?;
        Ok(Self {
            id,
            client_id: raw.client_id,
            sender_id: raw.sender_id,
            sender: raw.sender.or(raw.sender_role),
            content: raw.content.unwrap_or_default(),
            timestamp: raw.timestamp.or(raw.created_at),
            read: raw.read,
            status: raw.status,
            attachments: raw.attachments,
            order_id: raw.order_id,
            chat_id: raw.chat_id,
        })
    }
}

impl WireMessage {
    /// Conversation the message was addressed to, if stated.
    #[must_use]
    pub fn scope(&self) -> Option<ConversationRef> {
        if let Some(chat_id) = self.chat_id.as_deref().filter(|s| !s.is_empty()) {
            return Some(ConversationRef::Chat(ConversationId::new(chat_id)));
        }
        self.order_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|order_id| ConversationRef::Order(OrderId::new(order_id)))
    }

    /// Convert into the model type.
    #[must_use]
    pub fn into_message(self) -> Message {
        let sender = self.sender.unwrap_or_else(|| {
            self.sender_id
                .as_deref()
                .map_or(Role::Customer, Role::from_sender_id)
        });
        let status = self.status.unwrap_or(if self.read {
            DeliveryStatus::Read
        } else {
            DeliveryStatus::Delivered
        });

        Message {
            id: MessageId::new(self.id),
            client_id: self
                .client_id
                .as_deref()
                .and_then(|raw| raw.parse::<ClientMessageId>().ok()),
            sender,
            sender_id: self.sender_id.map(UserId::new),
            content: self.content,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            read: self.read,
            status,
            attachments: self
                .attachments
                .into_iter()
                .map(WireAttachment::into_attachment)
                .collect(),
        }
    }
}

/// Attachment metadata as sent by the backend.
///
/// The name may arrive as `filename`, `originalName` or `name` and the type
/// as `contentType`, `mimetype` or `mimeType`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    /// File name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Direct URL once processed.
    pub url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAttachment {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    original_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    url: Option<String>,
}

impl<'de> Deserialize<'de> for WireAttachment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawAttachment::deserialize(deserializer)?;
        let filename = raw
            .filename
            .or(raw.original_name)
            .or(raw.name)
            .ok_or_else(|| de::Error::missing_field("filename"))?;
        Ok(Self {
            filename,
            content_type: raw
                .content_type
                .or(raw.mimetype)
                .or(raw.mime_type)
                .unwrap_or_default(),
            size: raw.size,
            url: raw.url,
        })
    }
}

impl WireAttachment {
    fn into_attachment(self) -> Attachment {
        Attachment {
            filename: self.filename,
            content_type: self.content_type,
            size: self.size,
            url: self.url.filter(|u| !u.is_empty()),
        }
    }
}

/// A conversation as listed by the backend.
#[derive(Clone, Debug)]
pub struct WireConversation {
    /// Server id, from `_id` or `id`.
    pub id: String,
    /// Order scope.
    pub order_id: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Participant roles.
    pub participants: Vec<Role>,
    /// Customer account, from `customerId` or `userId`.
    pub customer_id: Option<String>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Last activity time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Newest message.
    pub last_message: Option<WireMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConversation {
    #[serde(default, rename = "_id")]
    mongo_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    participants: Vec<Role>,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_message: Option<WireMessage>,
}

impl<'de> Deserialize<'de> for WireConversation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawConversation::deserialize(deserializer)?;
        let id = raw
            .mongo_id
            .or(raw.id)
            .ok_or_else(|| de::Error::missing_field("_id"))?;
        Ok(Self {
            id,
            order_id: raw.order_id,
            subject: raw.subject,
            participants: raw.participants,
            customer_id: raw.customer_id.or(raw.user_id),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            last_message: raw.last_message,
        })
    }
}

impl TryFrom<WireConversation> for Conversation {
    type Error = ValidationError;

    fn try_from(wire: WireConversation) -> Result<Self, Self::Error> {
        let created_at = wire.created_at.unwrap_or_else(Utc::now);
        let mut conversation = Self::from_parts(
            ConversationId::new(wire.id),
            wire.order_id.filter(|s| !s.is_empty()).map(OrderId::new),
            wire.subject,
            created_at,
        )?;
        if !wire.participants.is_empty() {
            conversation.participants = wire.participants;
        }
        conversation.customer_id = wire.customer_id.map(UserId::new);
        conversation.updated_at = wire.updated_at.unwrap_or(created_at);
        if let Some(last) = wire.last_message {
            conversation.last_message = Some(last.into_message().preview());
        }
        Ok(conversation)
    }
}

/// History response; older deployments wrap the list in `chat`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryEnvelope {
    /// Messages of the requested page.
    #[serde(default, alias = "chat")]
    pub messages: Vec<WireMessage>,
}

/// Conversation list response.
#[derive(Debug, Default, Deserialize)]
pub struct ConversationListEnvelope {
    /// Conversations visible to the viewer.
    #[serde(default, alias = "chats")]
    pub conversations: Vec<WireConversation>,
}

/// Single conversation response.
#[derive(Debug, Deserialize)]
pub struct ConversationEnvelope {
    /// The conversation.
    #[serde(alias = "chat")]
    pub conversation: WireConversation,
}

/// Single message response.
#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
    /// The stored message.
    #[serde(alias = "data")]
    pub message: WireMessage,
}

/// Error body returned on non-success statuses.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a conversation creation.
#[derive(Debug, Serialize)]
pub struct CreateConversationRequest<'a> {
    /// Subject line.
    pub subject: &'a str,
    /// First message.
    pub message: &'a str,
}

/// Account returned by token validation.
#[derive(Clone, Debug)]
pub struct WireUser {
    /// Account id, from `id` or `_id`.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
    /// E-mail address.
    pub email: String,
    /// Account role.
    pub role: Option<String>,
}

#[derive(Deserialize)]
struct RawUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "_id")]
    mongo_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

impl<'de> Deserialize<'de> for WireUser {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawUser::deserialize(deserializer)?;
        let id = raw
            .id
            .or(raw.mongo_id)
            .ok_or_else(|| de::Error::missing_field("id"))?;
        Ok(Self {
            id,
            name: raw.name,
            email: raw.email.unwrap_or_default(),
            role: raw.role,
        })
    }
}

/// Token validation response.
#[derive(Debug, Deserialize)]
pub struct ValidateTokenResponse {
    /// Account behind the token, absent when the backend answers oddly.
    #[serde(default)]
    pub user: Option<WireUser>,
}
