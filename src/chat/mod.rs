//! Customer-support chat client for the Galaxy marketplace.
//!
//! This module is organized into:
//! - `core`: Identifiers, model, configuration and errors
//! - `api`: REST backend seam and its reqwest implementation
//! - `transport`: Socket.IO websocket connection, reconnection and event fan-out
//! - `cache`: Ordered message cache with optimistic reconciliation
//! - `history`: Paginated history loading
//! - `dispatch`: Outbound send pipeline (validation, optimistic entry, failure notice)
//! - `typing`: Local typing debounce and remote typing aggregation
//! - `directory`: Conversation list, previews and per-conversation caches
//! - `session`: The controller tying everything to one viewer

pub mod api;
pub mod cache;
pub mod core;
pub mod directory;
pub mod dispatch;
pub mod history;
pub mod session;
pub mod transport;
pub mod typing;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types for convenience
pub use api::{Account, AuthContext, AuthService, ChatBackend, HttpChatApi};
pub use cache::{MergeOutcome, MessageCache};
pub use core::{
    ApiError, Attachment, ChatConfig, ChatError, ChatResult, ClientMessageId, Conversation,
    ConversationId, ConversationKind, ConversationRef, DeliveryStatus, Message, MessageId,
    MessagePreview, OrderId, OutgoingFile, Role, TransportError, UserId, ValidationError, Viewer,
};
pub use directory::{ConversationDirectory, Routed};
pub use dispatch::{OutboundDispatcher, PendingSend, validate_files};
pub use history::{HistoryLoader, HistoryPage, load_page};
pub use session::{ChatSession, SessionEvent};
pub use transport::{
    ConnectionManager, ConnectionState, Connectivity, Connector, TransportEvent, WsConnector,
};
pub use typing::{RemoteTyping, TypingSignal, TypingTracker};
