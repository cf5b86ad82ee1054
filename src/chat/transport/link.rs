//! Connector seam between the connection manager and the wire.

use async_trait::async_trait;

use crate::chat::core::errors::TransportError;
use crate::chat::core::model::{ConversationRef, Viewer};
use crate::chat::transport::events::{InboundEvent, OutboundEvent};

/// Everything needed to open one realtime connection.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    /// Websocket endpoint.
    pub endpoint: String,
    /// Socket.IO mount path.
    pub path: String,
    /// Bearer token, passed in the handshake.
    pub token: String,
    /// Identity the connection is opened for.
    pub viewer: Viewer,
    /// Conversation the connection joins, if any.
    pub scope: Option<ConversationRef>,
}

/// Opens links; implemented over websockets and by in-memory fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link and complete the transport-level handshake.
    ///
    /// Returns [`TransportError::Rejected`] when the server refuses the
    /// credentials, which stops reconnection.
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Link>, TransportError>;
}

/// One open realtime connection.
#[async_trait]
pub trait Link: Send {
    /// Emit an event.
    async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError>;

    /// Next server event. `None` once the link is closed. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<InboundEvent, TransportError>>;

    /// Close gracefully.
    async fn close(&mut self);
}
