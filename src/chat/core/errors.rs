//! Error types for the chat client.

use thiserror::Error;

/// Input rejected before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Neither text nor attachments were provided.
    #[error("message is empty")]
    EmptyMessage,
    /// More files were selected than one message may carry.
    #[error("too many attachments: got {got}, max {max}")]
    TooManyFiles {
        /// Maximum allowed number of files.
        max: usize,
        /// Number of files selected.
        got: usize,
    },
    /// A single file exceeds the per-file cap.
    #[error("attachment {filename} is {size} bytes, max {max}")]
    FileTooLarge {
        /// Offending file name.
        filename: String,
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },
    /// A freeform conversation needs a subject.
    #[error("conversation subject is empty")]
    EmptySubject,
    /// A conversation record is neither order-scoped nor freeform, or both.
    #[error("invalid conversation: {0}")]
    ConversationShape(String),
}

/// REST backend failure.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend rejected the bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Non-success status with the backend's message, if any.
    #[error("backend returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the error body.
        message: String,
    },
    /// Response body did not match the expected shape.
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    /// A request URL could not be built.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    /// The response carried data that violates the model.
    #[error("invalid response data: {0}")]
    InvalidData(#[from] ValidationError),
}

impl ApiError {
    /// Whether the backend rejected the credentials.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Realtime transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket layer error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// A frame could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server refused the connection handshake.
    #[error("connection rejected: {0}")]
    Rejected(String),
    /// The connection attempt did not finish in time, or the server went
    /// silent past its announced heartbeat.
    #[error("timed out waiting for the server")]
    Timeout,
    /// The link is closed.
    #[error("connection closed")]
    Closed,
}

impl From<serde_json::Error> for TransportError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(value.to_string())
    }
}

/// Chat client error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport failed to connect or dropped beyond the retry budget.
    #[error("connection error: {0}")]
    Connection(String),
    /// History fetch failed; already loaded messages are kept.
    #[error("failed to load messages: {0}")]
    Load(#[source] ApiError),
    /// A message or attachment could not be delivered.
    #[error("failed to send message: {0}")]
    Send(String),
    /// Input rejected before any network call.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    /// Sending requires a connected transport.
    #[error("not connected")]
    NotConnected,
    /// Another send is still in flight for this conversation.
    #[error("a message is already being sent")]
    SendInFlight,
    /// The send targeted a connection instance that has since been replaced.
    #[error("connection was replaced before the message was written")]
    StaleConnection,
    /// No conversation is selected.
    #[error("no active conversation")]
    NoActiveConversation,
    /// REST backend error outside history loading.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// Realtime transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
    /// The session has been torn down.
    #[error("chat session is closed")]
    Closed,
}

impl ChatError {
    /// Check if the user can reasonably retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Load(err) | Self::Api(err) => !err.is_unauthorized(),
            Self::Connection(_)
            | Self::Send(_)
            | Self::NotConnected
            | Self::SendInFlight
            | Self::StaleConnection
            | Self::Transport(_) => true,
            Self::Validation(_) | Self::NoActiveConversation | Self::Config(_) | Self::Closed => {
                false
            }
        }
    }
}

/// Convenience result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
