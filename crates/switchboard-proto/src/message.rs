//! JSON message envelope.
//!
//! Every frame body is a JSON object whose `type` string selects the handler.
//! The rest of the object is type-specific and is kept verbatim so that
//! routed messages reach their recipient unmodified (field order included).

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::errors::{ProtocolError, Result};

/// Numeric identity claimed by a client at LOGIN.
pub type UserId = i64;

/// Message types the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Authenticate the connection as a user id
    Login,
    /// Route a payload to another user
    Chat,
    /// Keepalive
    Heartbeat,
}

impl MessageKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Chat => "CHAT",
            Self::Heartbeat => "HEARTBEAT",
        }
    }

    /// Look up a kind by its wire name. `None` for unknown types.
    pub fn from_type(name: &str) -> Option<Self> {
        match name {
            "LOGIN" => Some(Self::Login),
            "CHAT" => Some(Self::Chat),
            "HEARTBEAT" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message.
///
/// Thin wrapper over a JSON value. Decoding only checks that the body is
/// JSON; the `type` field and handler-specific fields are validated lazily by
/// the accessors, so a structurally odd message is ignored rather than fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Message(Value);

impl Message {
    /// Parse a frame body.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedJson` if the body is not valid JSON
    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map(Self)
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))
    }

    /// Serialize to a compact JSON body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// The `type` field, if present and a string.
    pub fn type_name(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// The known kind of this message. `None` if `type` is missing or unknown.
    pub fn kind(&self) -> Option<MessageKind> {
        self.type_name().and_then(MessageKind::from_type)
    }

    /// An integer field. `None` if missing or not an integer.
    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    /// Underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the underlying JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// `{"type":"LOGIN","id":<id>}`
    pub fn login(id: UserId) -> Self {
        Self(json!({ "type": MessageKind::Login.as_str(), "id": id }))
    }

    /// `{"type":"CHAT","to":<to>, ...fields}`
    ///
    /// `fields` are appended after `to`; a `type` or `to` key in `fields` is
    /// ignored.
    pub fn chat(to: UserId, fields: Map<String, Value>) -> Self {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::from(MessageKind::Chat.as_str()));
        object.insert("to".to_string(), Value::from(to));
        for (key, value) in fields {
            if key != "type" && key != "to" {
                object.insert(key, value);
            }
        }
        Self(Value::Object(object))
    }

    /// `{"type":"HEARTBEAT"}`
    pub fn heartbeat() -> Self {
        Self(json!({ "type": MessageKind::Heartbeat.as_str() }))
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
