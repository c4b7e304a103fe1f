//! Wire protocol messages and the frame codec.
//!
//! Every frame is one JSON object on a single line. Three shapes travel the
//! wire: requests `{id, method, params}`, responses `{id, result}` or
//! `{id, error}`, and host push events tagged `{"type": "event", ...}`.
//! Payloads are opaque [`Value`]s; the engine routes them, it never
//! interprets them.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

/// Allocates request ids, unique within one client.
///
/// Ids are monotonically increasing and thread-safe; uniqueness only has to
/// hold among calls pending on the same connection.
#[derive(Debug)]
pub(crate) struct RequestIdSource(AtomicI64);

impl RequestIdSource {
    pub(crate) const fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    pub(crate) fn next_id(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// A method invocation sent to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id linking the eventual response back to this request.
    pub id: i64,
    /// Method name, e.g. `commands.executeCommand`.
    pub method: String,
    /// Ordered parameter payload, opaque to the engine.
    #[serde(default)]
    pub params: Value,
}

/// The host's reply to a [`Request`].
///
/// Carries exactly one of `result` or `error`; a frame with neither is
/// rejected by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request this responds to.
    pub id: i64,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Error payload carried by a failed [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Host-defined error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// An asynchronous push notification from the host.
///
/// Events carry no id and expect no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    /// Topic string naming the event class.
    #[serde(rename = "event")]
    pub topic: String,
    /// Optional resource scope narrowing the topic to one created resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Event payload, opaque to the engine.
    #[serde(default)]
    pub data: Value,
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Caller-initiated method invocation.
    Request(Request),
    /// Host reply correlated by id.
    Response(Response),
    /// Host push event.
    Event(EventNotification),
}

/// Serialized form of an event frame, with the `type` discriminator.
#[derive(Serialize)]
struct EventFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<&'a str>,
    data: &'a Value,
}

impl<'a> From<&'a EventNotification> for EventFrame<'a> {
    fn from(event: &'a EventNotification) -> Self {
        Self {
            kind: "event",
            event: &event.topic,
            scope: event.scope.as_deref(),
            data: &event.data,
        }
    }
}

impl Message {
    /// Encodes the message as one frame, without the line terminator.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Json` when serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Self::Request(request) => serde_json::to_vec(request)?,
            Self::Response(response) => serde_json::to_vec(response)?,
            Self::Event(event) => serde_json::to_vec(&EventFrame::from(event))?,
        };
        Ok(bytes)
    }

    /// Decodes one frame into a message.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Json` for invalid JSON and
    /// `ProtocolError::UnrecognisedShape` for JSON that matches none of the
    /// three message shapes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Some(object) = value.as_object() else {
            return Err(ProtocolError::UnrecognisedShape);
        };

        if object.get("type").and_then(Value::as_str) == Some("event") {
            let event: EventNotification = serde_json::from_value(value)?;
            return Ok(Self::Event(event));
        }
        if object.contains_key("method") {
            let request: Request = serde_json::from_value(value)?;
            return Ok(Self::Request(request));
        }
        if object.contains_key("id")
            && (object.contains_key("result") || object.contains_key("error"))
        {
            let response: Response = serde_json::from_value(value)?;
            return Ok(Self::Response(response));
        }

        Err(ProtocolError::UnrecognisedShape)
    }
}
