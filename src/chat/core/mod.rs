//! Core chat types: identifiers, model, configuration and errors.

pub mod config;
pub mod errors;
pub mod ids;
pub mod model;

pub use config::ChatConfig;
pub use errors::{ApiError, ChatError, ChatResult, TransportError, ValidationError};
pub use ids::{ClientMessageId, ConversationId, MessageId, OrderId, UserId};
pub use model::{
    Attachment, Conversation, ConversationKind, ConversationRef, DeliveryStatus, Message,
    MessagePreview, OutgoingFile, Role, Viewer,
};
