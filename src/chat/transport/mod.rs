//! Realtime side of the chat backend.
//!
//! - [`events`]: outbound/inbound events and what subscribers observe
//! - [`codec`]: Engine.IO/Socket.IO text framing
//! - [`link`]: the [`Connector`] seam
//! - [`websocket`]: tokio-tungstenite implementation of that seam
//! - [`connection`]: [`ConnectionManager`], reconnection and state
//! - [`subscription`]: event fan-out with drop-to-unsubscribe

pub mod codec;
pub mod connection;
pub mod events;
pub mod link;
pub mod subscription;
pub mod websocket;

pub use connection::{ConnectionManager, ConnectionState, Connectivity};
pub use events::{InboundEvent, OutboundEvent, TransportEvent};
pub use link::{ConnectRequest, Connector, Link};
pub use subscription::{EventBus, Subscription};
pub use websocket::WsConnector;
