//! Socket.IO over websocket, built on tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::chat::core::errors::TransportError;
use crate::chat::core::model::ConversationRef;
use crate::chat::transport::codec::Packet;
use crate::chat::transport::events::{InboundEvent, OutboundEvent};
use crate::chat::transport::link::{ConnectRequest, Connector, Link};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector speaking Engine.IO v4 over a websocket.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Build the handshake URL: websocket transport, identity as query.
    ///
    /// # Errors
    /// Returns an error if the endpoint is not a valid URL or has an
    /// unsupported scheme.
    pub fn handshake_url(request: &ConnectRequest) -> Result<Url, TransportError> {
        let mut url = Url::parse(&request.endpoint)
            .map_err(|e| TransportError::Protocol(format!("invalid endpoint: {e}")))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::Protocol(format!(
                    "unsupported scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::Protocol("cannot set scheme".to_string()))?;

        let path = format!("{}/", request.path.trim_end_matches('/'));
        url.set_path(&path);

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query
                .append_pair("EIO", "4")
                .append_pair("transport", "websocket")
                .append_pair("token", &request.token)
                .append_pair("userId", request.viewer.user_id.as_str())
                .append_pair("role", request.viewer.role.as_str());
            match &request.scope {
                Some(ConversationRef::Order(order_id)) => {
                    query.append_pair("orderId", order_id.as_str());
                }
                Some(ConversationRef::Chat(chat_id)) => {
                    query.append_pair("chatId", chat_id.as_str());
                }
                None => {}
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Link>, TransportError> {
        let url = Self::handshake_url(request)?;
        debug!(endpoint = %request.endpoint, "Opening websocket");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let mut link = WsLink {
            stream,
            heartbeat: None,
            last_seen: Instant::now(),
        };

        // Engine.IO open, then Socket.IO namespace connect with the token.
        match link.next_packet().await? {
            Packet::Open(handshake) => {
                trace!(
                    sid = %handshake.sid,
                    ping_interval = handshake.ping_interval,
                    ping_timeout = handshake.ping_timeout,
                    "Engine.IO open"
                );
                let window = handshake.ping_interval.saturating_add(handshake.ping_timeout);
                link.heartbeat = (window > 0).then(|| Duration::from_millis(window));
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {other:?}"
                )));
            }
        }

        let auth = serde_json::json!({ "token": request.token });
        link.write(&Packet::Connect(Some(auth))).await?;

        loop {
            match link.next_packet().await? {
                Packet::Connect(_) => break,
                Packet::ConnectError(reason) => return Err(TransportError::Rejected(reason)),
                Packet::Ping => link.write(&Packet::Pong).await?,
                Packet::Close | Packet::Disconnect => return Err(TransportError::Closed),
                _ => {}
            }
        }
        link.last_seen = Instant::now();

        Ok(Box::new(link))
    }
}

/// An open Socket.IO connection.
///
/// The server pings every `pingInterval` and expects silence to end within
/// `pingTimeout`; a link quiet for longer than both is considered dead.
struct WsLink {
    stream: WsStream,
    heartbeat: Option<Duration>,
    last_seen: Instant,
}

impl WsLink {
    async fn write(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Text(packet.encode()?)).await?;
        Ok(())
    }

    /// Next websocket frame, failing with [`TransportError::Timeout`] once the
    /// heartbeat window since the last frame has passed.
    async fn next_frame(&mut self) -> Option<Result<WsMessage, TransportError>> {
        let Some(heartbeat) = self.heartbeat else {
            return self.stream.next().await.map(|frame| frame.map_err(TransportError::from));
        };
        match tokio::time::timeout_at(self.last_seen + heartbeat, self.stream.next()).await {
            Ok(frame) => {
                self.last_seen = Instant::now();
                frame.map(|frame| frame.map_err(TransportError::from))
            }
            Err(_) => {
                warn!(?heartbeat, "Server heartbeat missed");
                Some(Err(TransportError::Timeout))
            }
        }
    }

    /// Next decodable text packet; used during the handshake.
    async fn next_packet(&mut self) -> Result<Packet, TransportError> {
        loop {
            match self.stream.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(WsMessage::Text(text))) => return Packet::decode(&text),
                Some(Ok(WsMessage::Close(_))) => return Err(TransportError::Closed),
                Some(Ok(_)) => {}
            }
        }
    }
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError> {
        self.write(&Packet::Event {
            name: event.name().to_string(),
            data: event.payload(),
        })
        .await
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent, TransportError>> {
        loop {
            let text = match self.next_frame().await? {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            };

            match Packet::decode(&text) {
                Ok(Packet::Ping) => {
                    if let Err(err) = self.write(&Packet::Pong).await {
                        return Some(Err(err));
                    }
                }
                Ok(Packet::Event { name, data }) => match InboundEvent::from_event(&name, data) {
                    Ok(event) => return Some(Ok(event)),
                    Err(err) => warn!(event = %name, %err, "Dropping malformed event"),
                },
                Ok(Packet::ConnectError(reason)) => {
                    return Some(Ok(InboundEvent::AuthFailed(reason)));
                }
                Ok(Packet::Close | Packet::Disconnect) => return None,
                Ok(_) => {}
                Err(err) => warn!(%err, "Dropping undecodable frame"),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.write(&Packet::Disconnect).await {
            debug!(%err, "Disconnect packet not delivered");
        }
        if let Err(err) = self.stream.close(None).await {
            debug!(%err, "Websocket close failed");
        }
    }
}
