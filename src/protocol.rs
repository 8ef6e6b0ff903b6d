//! Control-channel message codec.
//!
//! Every message on a control channel is one JSON object with two top-level
//! fields: a string `type` and an object `payload`. The payload always
//! carries a millisecond Unix `timestamp`. HTTP bodies travel as base64 —
//! an absent body is an explicit `null`, never a missing key.
//!
//! Decoding separates two failure classes so the session loop can answer
//! without closing the channel:
//!
//! - [`DecodeError::Malformed`] — not JSON, or a known type with a payload
//!   that doesn't match its shape (`INVALID_MESSAGE`);
//! - [`DecodeError::UnknownType`] — valid JSON whose `type` is not part of
//!   the protocol (`UNKNOWN_MESSAGE`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::util::now_millis;

/// One framed message on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    /// client → gateway: request a tunnel.
    #[serde(rename = "tunnel:register")]
    Register(RegisterPayload),
    /// gateway → client: registration succeeded.
    #[serde(rename = "tunnel:registered")]
    Registered(RegisteredPayload),
    /// either direction: close a tunnel.
    #[serde(rename = "tunnel:close")]
    Close(ClosePayload),
    /// gateway → client: deliver a public HTTP request.
    #[serde(rename = "http:request")]
    HttpRequest(HttpRequestPayload),
    /// client → gateway: the local server's response.
    #[serde(rename = "http:response")]
    HttpResponse(HttpResponsePayload),
    /// client → gateway: the local server could not answer.
    #[serde(rename = "http:error")]
    HttpError(HttpErrorPayload),
    /// either direction: liveness probe.
    #[serde(rename = "ping")]
    Ping(PingPayload),
    /// either direction: liveness reply.
    #[serde(rename = "pong")]
    Pong(PongPayload),
    /// gateway → client: a request or message was rejected.
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub tunnel_id: String,
    pub public_url: String,
    pub subdomain: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub tunnel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestPayload {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Base64 of the raw body bytes; `None` serializes as explicit `null`.
    pub body: Option<String>,
    pub query: HashMap<String, String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponsePayload {
    pub request_id: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpErrorPayload {
    pub request_id: String,
    pub error: String,
    pub code: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub timestamp: u64,
}

/// The `type` strings this protocol defines.
const KNOWN_TYPES: &[&str] = &[
    "tunnel:register",
    "tunnel:registered",
    "tunnel:close",
    "http:request",
    "http:response",
    "http:error",
    "ping",
    "pong",
    "error",
];

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl DecodeError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) => ErrorCode::InvalidMessage,
            Self::UnknownType(_) => ErrorCode::UnknownMessage,
        }
    }
}

/// Serialize a message to its wire form.
pub fn encode(msg: &ControlMessage) -> String {
    serde_json::to_string(msg).expect("control messages serialize")
}

/// Parse a wire frame into a [`ControlMessage`].
pub fn decode(text: &str) -> Result<ControlMessage, DecodeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| DecodeError::Malformed(format!("malformed JSON: {e}")))?;

    let msg_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing string field 'type'".to_string()))?;

    if !KNOWN_TYPES.contains(&msg_type) {
        return Err(DecodeError::UnknownType(msg_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

impl ControlMessage {
    /// A ping stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(PingPayload {
            timestamp: now_millis(),
        })
    }

    /// A pong echoing the originating ping's timestamp.
    #[must_use]
    pub fn pong(ping_timestamp: u64) -> Self {
        Self::Pong(PongPayload {
            timestamp: now_millis(),
            ping_timestamp: Some(ping_timestamp),
        })
    }

    /// An error reply stamped with the current time.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code: code.as_str().to_string(),
            message: message.into(),
            timestamp: now_millis(),
        })
    }
}
