//! Envelope frames exchanged with the agent gateway.
//!
//! Every message on the socket is a JSON object whose `type` field selects
//! one of three shapes: a request sent by the client, a response correlated
//! to a request by `id`, or a named event pushed by the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSON message on the gateway socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client -> gateway request.
    #[serde(rename = "req")]
    Req(RequestFrame),
    /// Gateway -> client response to an earlier request.
    #[serde(rename = "res")]
    Res(ResponseFrame),
    /// Gateway -> client event.
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// `{type:"req", id, method, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Caller-chosen identifier, echoed back in the matching response.
    pub id: String,
    /// Gateway method name (e.g. `connect`, `agent`).
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// `{type:"res", id, ok, error?, payload?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Identifier of the request this answers.
    pub id: String,
    /// Whether the gateway accepted the request.
    #[serde(default)]
    pub ok: bool,
    /// Failure details when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    /// Method-specific result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ResponseFrame {
    /// Human-readable failure message, or `fallback` when the gateway sent none.
    #[must_use]
    pub fn error_message(&self, fallback: &str) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Machine-readable error code.
    #[serde(default)]
    pub code: String,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
}

/// `{type:"event", event, payload?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name used for subscription lookup.
    pub event: String,
    /// Event body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}
