//! Structured control-channel messages
//!
//! Text messages on a control channel are JSON objects. The optional `kind`
//! field tells a receiver how to parse the rest: absent for HTTP
//! request/response pairs, `"WS"` for WebSocket-over-tunnel events, anything
//! else (in practice `"CTRL"`) for keepalives. Optional fields are omitted
//! from the wire when empty.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Header map carried by envelopes (single value per name)
pub type Headers = HashMap<String, String>;

/// Message errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Unknown tunnel type: {0}")]
    UnknownTunnelType(String),
}

/// Kind of tunnel exposed to the public internet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelType {
    Http,
    Tcp,
    Udp,
}

impl TunnelType {
    /// Stream tunnels own a public listener socket
    pub fn is_stream(&self) -> bool {
        matches!(self, TunnelType::Tcp | TunnelType::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Http => "HTTP",
            TunnelType::Tcp => "TCP",
            TunnelType::Udp => "UDP",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelType::Http),
            "tcp" => Ok(TunnelType::Tcp),
            "udp" => Ok(TunnelType::Udp),
            _ => Err(MessageError::UnknownTunnelType(s.to_string())),
        }
    }
}

/// HTTP envelope direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMessageType {
    Request,
    Response,
}

/// One HTTP request or response relayed over a tunnel, correlated by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTunnelMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: HttpMessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_headers: Option<Headers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_body_b64: Option<String>,
}

impl HttpTunnelMessage {
    /// Build a REQUEST. Empty query, headers and body are left off the wire.
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        query: Option<String>,
        headers: Headers,
        body: &[u8],
    ) -> Self {
        Self {
            id: id.into(),
            message_type: HttpMessageType::Request,
            method: Some(method.into()),
            path: Some(path.into()),
            query: query.filter(|q| !q.is_empty()),
            headers: (!headers.is_empty()).then_some(headers),
            body_b64: (!body.is_empty()).then(|| STANDARD.encode(body)),
            status: None,
            resp_headers: None,
            resp_body_b64: None,
        }
    }

    /// Build a RESPONSE for request `id`
    pub fn response(id: impl Into<String>, status: u16, headers: Headers, body: &[u8]) -> Self {
        Self {
            id: id.into(),
            message_type: HttpMessageType::Response,
            method: None,
            path: None,
            query: None,
            headers: None,
            body_b64: None,
            status: Some(status),
            resp_headers: (!headers.is_empty()).then_some(headers),
            resp_body_b64: (!body.is_empty()).then(|| STANDARD.encode(body)),
        }
    }

    /// Decoded request body (empty when absent)
    pub fn body(&self) -> Result<Vec<u8>, MessageError> {
        decode_b64(self.body_b64.as_deref())
    }

    /// Decoded response body (empty when absent)
    pub fn response_body(&self) -> Result<Vec<u8>, MessageError> {
        decode_b64(self.resp_body_b64.as_deref())
    }
}

/// Marker serialized as `"kind": "WS"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsKind {
    #[default]
    #[serde(rename = "WS")]
    Ws,
}

/// WebSocket-over-tunnel event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsType {
    Open,
    OpenOk,
    Text,
    Binary,
    Close,
    Error,
    /// Sent by the relay once a stream tunnel is bound, carrying its public endpoint
    Exposed,
}

/// WebSocket-over-tunnel event, also used for stream-tunnel lifecycle
/// (OPEN/CLOSE per public connection, EXPOSED per tunnel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsTunnelMessage {
    #[serde(default)]
    pub kind: WsKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub ws_type: WsType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

impl WsTunnelMessage {
    pub fn new(ws_type: WsType) -> Self {
        Self {
            kind: WsKind::Ws,
            connection_id: None,
            id: None,
            ws_type,
            path: None,
            query: None,
            headers: None,
            text: None,
            data_b64: None,
            close_code: None,
            close_reason: None,
            public_host: None,
            public_port: None,
        }
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn open(
        connection_id: impl Into<String>,
        path: Option<String>,
        query: Option<String>,
        headers: Option<Headers>,
    ) -> Self {
        let mut message = Self::new(WsType::Open).with_connection_id(connection_id);
        message.path = path;
        message.query = query.filter(|q| !q.is_empty());
        message.headers = headers.filter(|h| !h.is_empty());
        message
    }

    pub fn open_ok(connection_id: impl Into<String>) -> Self {
        Self::new(WsType::OpenOk).with_connection_id(connection_id)
    }

    pub fn text(connection_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(WsType::Text).with_connection_id(connection_id);
        message.text = Some(text.into());
        message
    }

    pub fn binary(connection_id: impl Into<String>, data: &[u8]) -> Self {
        let mut message = Self::new(WsType::Binary).with_connection_id(connection_id);
        message.data_b64 = Some(STANDARD.encode(data));
        message
    }

    pub fn close(connection_id: impl Into<String>, code: Option<u16>, reason: Option<String>) -> Self {
        let mut message = Self::new(WsType::Close).with_connection_id(connection_id);
        message.close_code = code;
        message.close_reason = reason.filter(|r| !r.is_empty());
        message
    }

    pub fn error(connection_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut message = Self::new(WsType::Error).with_connection_id(connection_id);
        message.close_reason = Some(reason.into());
        message
    }

    pub fn exposed(public_host: impl Into<String>, public_port: u16) -> Self {
        let mut message = Self::new(WsType::Exposed);
        message.public_host = Some(public_host.into());
        message.public_port = Some(public_port);
        message
    }

    /// Decoded BINARY payload (empty when absent)
    pub fn data(&self) -> Result<Vec<u8>, MessageError> {
        decode_b64(self.data_b64.as_deref())
    }
}

/// Marker serialized as `"kind": "CTRL"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    #[default]
    #[serde(rename = "CTRL")]
    Ctrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlType {
    Ping,
    Pong,
}

/// Application-level keepalive on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default)]
    pub kind: ControlKind,

    #[serde(rename = "type")]
    pub control_type: ControlType,

    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl ControlMessage {
    pub fn ping(ts: i64) -> Self {
        Self {
            kind: ControlKind::Ctrl,
            control_type: ControlType::Ping,
            ts: Some(ts),
        }
    }

    pub fn pong(ts: i64) -> Self {
        Self {
            kind: ControlKind::Ctrl,
            control_type: ControlType::Pong,
            ts: Some(ts),
        }
    }
}

/// Dispatch class of a text message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Http,
    Ws,
    Control,
}

/// Routing envelope: only the `kind` field, everything else ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl MessageEnvelope {
    pub fn message_kind(&self) -> MessageKind {
        match self.kind.as_deref() {
            None => MessageKind::Http,
            Some("WS") => MessageKind::Ws,
            Some(_) => MessageKind::Control,
        }
    }

    /// Read just the `kind` of a text message
    pub fn peek(text: &str) -> Result<MessageKind, MessageError> {
        let envelope: MessageEnvelope = serde_json::from_str(text)?;
        Ok(envelope.message_kind())
    }
}

/// Any text message a control channel can carry
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelMessage {
    Http(HttpTunnelMessage),
    Ws(WsTunnelMessage),
    Control(ControlMessage),
}

impl TunnelMessage {
    /// Parse a text message, dispatching on its `kind`
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        Ok(match MessageEnvelope::peek(text)? {
            MessageKind::Http => TunnelMessage::Http(serde_json::from_str(text)?),
            MessageKind::Ws => TunnelMessage::Ws(serde_json::from_str(text)?),
            MessageKind::Control => TunnelMessage::Control(serde_json::from_str(text)?),
        })
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(match self {
            TunnelMessage::Http(message) => serde_json::to_string(message)?,
            TunnelMessage::Ws(message) => serde_json::to_string(message)?,
            TunnelMessage::Control(message) => serde_json::to_string(message)?,
        })
    }
}

impl From<HttpTunnelMessage> for TunnelMessage {
    fn from(message: HttpTunnelMessage) -> Self {
        TunnelMessage::Http(message)
    }
}

impl From<WsTunnelMessage> for TunnelMessage {
    fn from(message: WsTunnelMessage) -> Self {
        TunnelMessage::Ws(message)
    }
}

impl From<ControlMessage> for TunnelMessage {
    fn from(message: ControlMessage) -> Self {
        TunnelMessage::Control(message)
    }
}

/// Request to expose a tunnel on an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeRequest {
    pub tunnel_id: String,
    pub tunnel_type: TunnelType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_port: Option<u16>,

    /// Routable subdomain for HTTP tunnels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

/// Public endpoint of an exposed tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeResponse {
    pub tunnel_id: String,
    pub public_host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

fn decode_b64(value: Option<&str>) -> Result<Vec<u8>, MessageError> {
    match value {
        Some(encoded) => Ok(STANDARD.decode(encoded)?),
        None => Ok(Vec::new()),
    }
}
