//! Realtime channel events.
//!
//! Outbound events are what this client emits; inbound events are decoded
//! from server emissions; [`TransportEvent`] is what subscribers observe,
//! connection lifecycle transitions included.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::chat::api::dto::WireMessage;
use crate::chat::core::errors::TransportError;
use crate::chat::core::ids::{ClientMessageId, ConversationId, MessageId, OrderId, UserId};
use crate::chat::core::model::{ConversationRef, DeliveryStatus, Message, Role, Viewer};

/// Events emitted by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundEvent {
    /// Identify the viewer and its scope on a fresh connection.
    Authenticate {
        /// Viewer account.
        user_id: UserId,
        /// Viewer role.
        role: Role,
        /// Scope the connection is opened for.
        scope: Option<ConversationRef>,
    },
    /// Join the room of a conversation.
    Join(ConversationRef),
    /// Leave the room of a conversation.
    Leave(ConversationRef),
    /// Post a text message.
    NewMessage {
        /// Target conversation.
        scope: ConversationRef,
        /// Text body.
        content: String,
        /// Customer addressed by a support agent.
        receiver_id: Option<UserId>,
        /// Correlation key the server echoes back.
        client_id: ClientMessageId,
    },
    /// Local typing state changed.
    Typing {
        /// Target conversation.
        scope: ConversationRef,
        /// New state.
        is_typing: bool,
    },
    /// A message was displayed to the viewer.
    MessageRead {
        /// Order thread.
        order_id: OrderId,
        /// Message read.
        message_id: MessageId,
    },
}

impl OutboundEvent {
    /// Handshake event for a viewer.
    #[must_use]
    pub fn authenticate(viewer: &Viewer, scope: Option<&ConversationRef>) -> Self {
        Self::Authenticate {
            user_id: viewer.user_id.clone(),
            role: viewer.role,
            scope: scope.cloned(),
        }
    }

    /// Socket.IO event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join(ConversationRef::Order(_)) => "join-order-chat",
            Self::Join(ConversationRef::Chat(_)) => "join-chat",
            Self::Leave(ConversationRef::Order(_)) => "leave-order-chat",
            Self::Leave(ConversationRef::Chat(_)) => "leave-chat",
            Self::NewMessage { .. } => "new-message",
            Self::Typing { .. } => "typing",
            Self::MessageRead { .. } => "message-read",
        }
    }

    /// JSON payload sent with the event.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Authenticate {
                user_id,
                role,
                scope,
            } => {
                let mut body = Map::new();
                body.insert("userId".to_string(), json!(user_id));
                body.insert("role".to_string(), json!(role));
                if let Some(scope) = scope {
                    insert_scope(&mut body, scope);
                }
                Value::Object(body)
            }
            Self::Join(scope) | Self::Leave(scope) => {
                let mut body = Map::new();
                insert_scope(&mut body, scope);
                Value::Object(body)
            }
            Self::NewMessage {
                scope,
                content,
                receiver_id,
                client_id,
            } => {
                let mut body = Map::new();
                insert_scope(&mut body, scope);
                body.insert("content".to_string(), json!(content));
                body.insert("clientId".to_string(), json!(client_id.to_string()));
                if let Some(receiver_id) = receiver_id {
                    body.insert("receiverId".to_string(), json!(receiver_id));
                }
                Value::Object(body)
            }
            Self::Typing { scope, is_typing } => {
                let mut body = Map::new();
                insert_scope(&mut body, scope);
                body.insert("isTyping".to_string(), json!(is_typing));
                Value::Object(body)
            }
            Self::MessageRead {
                order_id,
                message_id,
            } => json!({ "orderId": order_id, "messageId": message_id }),
        }
    }
}

fn insert_scope(body: &mut Map<String, Value>, scope: &ConversationRef) {
    match scope {
        ConversationRef::Order(order_id) => {
            body.insert("orderId".to_string(), json!(order_id));
        }
        ConversationRef::Chat(chat_id) => {
            body.insert("chatId".to_string(), json!(chat_id));
        }
    }
}

/// Events decoded from server emissions.
#[derive(Clone, Debug)]
pub enum InboundEvent {
    /// A message was stored in some conversation.
    Message(Box<WireMessage>),
    /// A remote participant started or stopped typing.
    Typing {
        /// Remote participant.
        user_id: UserId,
        /// New state.
        is_typing: bool,
        /// Conversation, when the server states it.
        scope: Option<ConversationRef>,
    },
    /// Delivery progress of a message changed.
    StatusUpdate {
        /// Message concerned.
        message_id: MessageId,
        /// New status.
        status: DeliveryStatus,
    },
    /// The server refused the viewer's credentials.
    AuthFailed(String),
    /// Any event this client does not act on.
    Other(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    user_id: String,
    #[serde(default)]
    is_typing: bool,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    message_id: String,
    status: DeliveryStatus,
}

impl InboundEvent {
    /// Decode a named server event.
    ///
    /// # Errors
    /// Returns an error if a known event carries a malformed payload.
    pub fn from_event(name: &str, data: Value) -> Result<Self, TransportError> {
        match name {
            "new-message" => Ok(Self::Message(Box::new(serde_json::from_value(data)?))),
            "typing" => {
                let payload: TypingPayload = serde_json::from_value(data)?;
                let scope = payload
                    .chat_id
                    .map(|id| ConversationRef::Chat(ConversationId::new(id)))
                    .or_else(|| {
                        payload
                            .order_id
                            .map(|id| ConversationRef::Order(OrderId::new(id)))
                    });
                Ok(Self::Typing {
                    user_id: UserId::new(payload.user_id),
                    is_typing: payload.is_typing,
                    scope,
                })
            }
            "message-status-update" => {
                let payload: StatusPayload = serde_json::from_value(data)?;
                Ok(Self::StatusUpdate {
                    message_id: MessageId::new(payload.message_id),
                    status: payload.status,
                })
            }
            "auth-error" | "unauthorized" | "authentication-error" => {
                let reason = data
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| data.as_str())
                    .unwrap_or("authentication rejected")
                    .to_string();
                Ok(Self::AuthFailed(reason))
            }
            other => Ok(Self::Other(other.to_string())),
        }
    }
}

/// What subscribers of a connection observe.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// First successful connection, handshake issued.
    Connected {
        /// Connection instance number.
        epoch: u64,
    },
    /// Connection restored after a loss, handshake re-issued.
    Reconnected {
        /// Attempts it took.
        attempt: u32,
        /// Connection instance number.
        epoch: u64,
    },
    /// A connection attempt failed.
    ConnectError(String),
    /// The connection was lost or given up on.
    Disconnected {
        /// Human-readable reason.
        reason: String,
        /// Whether the manager stopped retrying.
        gave_up: bool,
    },
    /// Credentials were rejected; no further attempts are made.
    AuthFailed(String),
    /// A message arrived.
    Message {
        /// Conversation addressed, when stated.
        scope: Option<ConversationRef>,
        /// Connection instance it arrived on.
        epoch: u64,
        /// The message.
        message: Box<Message>,
    },
    /// Remote typing state changed.
    Typing {
        /// Remote participant.
        user_id: UserId,
        /// New state.
        is_typing: bool,
        /// Conversation, when stated.
        scope: Option<ConversationRef>,
    },
    /// Delivery progress changed.
    StatusUpdate {
        /// Message concerned.
        message_id: MessageId,
        /// New status.
        status: DeliveryStatus,
    },
}

impl TransportEvent {
    /// Lift a decoded server event received on connection `epoch`; returns
    /// `None` for events nobody consumes.
    #[must_use]
    pub fn from_inbound(event: InboundEvent, epoch: u64) -> Option<Self> {
        match event {
            InboundEvent::Message(wire) => {
                let scope = wire.scope();
                Some(Self::Message {
                    scope,
                    epoch,
                    message: Box::new(wire.into_message()),
                })
            }
            InboundEvent::Typing {
                user_id,
                is_typing,
                scope,
            } => Some(Self::Typing {
                user_id,
                is_typing,
                scope,
            }),
            InboundEvent::StatusUpdate { message_id, status } => {
                Some(Self::StatusUpdate { message_id, status })
            }
            InboundEvent::AuthFailed(reason) => Some(Self::AuthFailed(reason)),
            InboundEvent::Other(_) => None,
        }
    }
}
