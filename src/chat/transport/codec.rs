//! Engine.IO v4 / Socket.IO v5 text packet codec.
//!
//! Only the default namespace and text frames are supported. Packet layout:
//! one Engine.IO type digit, then for message packets (`4`) one Socket.IO
//! type digit, an optional `/nsp,` prefix, an optional ack id and the JSON
//! body.

use serde::Deserialize;
use serde_json::Value;

use crate::chat::core::errors::TransportError;

/// Parameters announced by the server when the transport opens.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine.IO session id.
    pub sid: String,
    /// Server ping interval in milliseconds.
    #[serde(default)]
    pub ping_interval: u64,
    /// Server ping timeout in milliseconds.
    #[serde(default)]
    pub ping_timeout: u64,
}

/// A decoded text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Engine.IO open (`0`).
    Open(OpenHandshake),
    /// Engine.IO close (`1`).
    Close,
    /// Engine.IO ping (`2`).
    Ping,
    /// Engine.IO pong (`3`).
    Pong,
    /// Socket.IO namespace connect (`40`), with auth or session payload.
    Connect(Option<Value>),
    /// Socket.IO namespace disconnect (`41`).
    Disconnect,
    /// Socket.IO event (`42`).
    Event {
        /// Event name.
        name: String,
        /// First argument, `null` when absent.
        data: Value,
    },
    /// Socket.IO connect error (`44`).
    ConnectError(String),
    /// Engine.IO noop (`6`) and packets this client ignores.
    Noop,
}

impl Packet {
    /// Encode into a text frame.
    ///
    /// # Errors
    /// Returns an error for packets the client never sends (`Open`) or if
    /// the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, TransportError> {
        match self {
            Self::Close => Ok("1".to_string()),
            Self::Ping => Ok("2".to_string()),
            Self::Pong => Ok("3".to_string()),
            Self::Connect(None) => Ok("40".to_string()),
            Self::Connect(Some(auth)) => Ok(format!("40{}", serde_json::to_string(auth)?)),
            Self::Disconnect => Ok("41".to_string()),
            Self::Event { name, data } => {
                let body = if data.is_null() {
                    serde_json::to_string(&[Value::String(name.clone())])?
                } else {
                    serde_json::to_string(&(name, data))?
                };
                Ok(format!("42{body}"))
            }
            Self::ConnectError(message) => Ok(format!(
                "44{}",
                serde_json::to_string(&serde_json::json!({ "message": message }))?
            )),
            Self::Noop => Ok("6".to_string()),
            Self::Open(_) => Err(TransportError::Protocol(
                "clients do not send open packets".to_string(),
            )),
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns an error if the frame is empty, has an unknown type or a
    /// malformed body.
    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        let mut chars = frame.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| TransportError::Protocol("empty frame".to_string()))?;
        let rest = chars.as_str();

        match engine_type {
            '0' => Ok(Self::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '4' => decode_socket_packet(rest),
            '5' | '6' => Ok(Self::Noop),
            other => Err(TransportError::Protocol(format!(
                "unknown engine packet type {other:?}"
            ))),
        }
    }
}

fn decode_socket_packet(frame: &str) -> Result<Packet, TransportError> {
    let mut chars = frame.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| TransportError::Protocol("empty socket packet".to_string()))?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));

    match socket_type {
        '0' => {
            if body.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(body)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(body),
        '4' => {
            let value: Value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(body)?
            };
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| value.as_str())
                .unwrap_or("connection refused")
                .to_string();
            Ok(Packet::ConnectError(message))
        }
        // acks and binary packets
        '3' | '5' | '6' => Ok(Packet::Noop),
        other => Err(TransportError::Protocol(format!(
            "unknown socket packet type {other:?}"
        ))),
    }
}

fn decode_event(body: &str) -> Result<Packet, TransportError> {
    let values: Vec<Value> = serde_json::from_str(body)?;
    let mut values = values.into_iter();
    let name = match values.next() {
        Some(Value::String(name)) => name,
        _ => {
            return Err(TransportError::Protocol(
                "event packet without a name".to_string(),
            ));
        }
    };
    Ok(Packet::Event {
        name,
        data: values.next().unwrap_or(Value::Null),
    })
}

/// Drop a `/namespace,` prefix; only the default namespace is used.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        body.split_once(',').map_or("", |(_, rest)| rest)
    } else {
        body
    }
}

/// Drop a numeric ack id preceding the JSON body.
fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}
