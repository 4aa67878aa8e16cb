//! Wire format shared by the server and client: JSON text frames shaped
//! `{ "type": string, "payload": any }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UPDATE: &str = "update";
pub const DONE: &str = "done";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Body of an `update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Base64 (standard alphabet, padded) archive bytes.
    pub zip: String,
}

/// What a received frame means to either endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Update(UpdatePayload),
    Done,
    /// Well-formed but not something we act on.
    Other(Envelope),
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn update(zip_base64: String) -> Self {
        Self::new(UPDATE, serde_json::json!({ "zip": zip_base64 }))
    }

    pub fn done() -> Self {
        Self::new(DONE, Value::Null)
    }

    /// Parse a text frame. Only text that is not JSON at all is an error:
    /// an object without a string `type`, or any non-object value, becomes
    /// an envelope with an empty `kind` carrying the whole value as payload.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::from_value)
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) if matches!(map.get("type"), Some(Value::String(_))) => {
                let kind = match map.remove("type") {
                    Some(Value::String(kind)) => kind,
                    _ => String::new(),
                };
                let payload = map.remove("payload").unwrap_or(Value::Null);
                Self { kind, payload }
            }
            other => Self {
                kind: String::new(),
                payload: other,
            },
        }
    }

    pub fn to_text(&self) -> String {
        // Serializing a String + Value cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Interpret the frame. An `update` whose payload lacks `zip` is an error.
    pub fn interpret(self) -> Result<Incoming, serde_json::Error> {
        match self.kind.as_str() {
            UPDATE => serde_json::from_value(self.payload).map(Incoming::Update),
            DONE => Ok(Incoming::Done),
            _ => Ok(Incoming::Other(self)),
        }
    }
}
