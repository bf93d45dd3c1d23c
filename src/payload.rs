//! Message payloads and outbound envelopes.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::bus::{Attributes, OutboundMessage, CONTENT_TYPE_ATTRIBUTE, MESSAGE_ID_ATTRIBUTE};
use crate::error::DecodeError;

/// Field carrying the correlation id inside structured records.
pub const MESSAGE_ID_FIELD: &str = "message_id";

/// Field holding the reply body in structured replies.
pub const MESSAGE_FIELD: &str = "message";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
pub const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

/// A decoded or to-be-encoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Structured(Value),
}

impl Payload {
    /// Serialize any value into a structured payload.
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Payload::Structured)
    }

    /// Serialize a value, falling back to its debug text when serde refuses it.
    pub fn best_effort<T: Serialize + fmt::Debug>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Payload::Structured(value),
            Err(_) => Payload::Text(format!("{value:?}")),
        }
    }

    /// Decode transport bytes published without a content type.
    ///
    /// Invalid UTF-8 is replaced, never rejected. Text that opens with `{` must
    /// parse as JSON. Text that opens with `[` is taken as JSON when it parses.
    /// Anything else is passed through as text.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with(data, None)
    }

    /// Decode transport bytes tagged with the content type they were encoded as.
    ///
    /// Unknown or missing content types fall back to [`Payload::decode`]'s rules.
    pub fn decode_with(data: &[u8], content_type: Option<&str>) -> Result<Self, DecodeError> {
        match content_type {
            Some(BYTES_CONTENT_TYPE) => return Ok(Payload::Bytes(data.to_vec())),
            Some(TEXT_CONTENT_TYPE) => {
                return Ok(Payload::Text(String::from_utf8_lossy(data).into_owned()))
            }
            _ => {}
        }

        let text = String::from_utf8_lossy(data);
        if content_type == Some(JSON_CONTENT_TYPE) {
            return Ok(Payload::Structured(serde_json::from_str(&text)?));
        }
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            Ok(Payload::Structured(serde_json::from_str(&text)?))
        } else if trimmed.starts_with('[') {
            Ok(serde_json::from_str(&text)
                .map(Payload::Structured)
                .unwrap_or_else(|_| Payload::Text(text.into_owned())))
        } else {
            Ok(Payload::Text(text.into_owned()))
        }
    }

    /// Content type recorded alongside [`Payload::encode`]'s bytes.
    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => BYTES_CONTENT_TYPE,
            Payload::Text(_) => TEXT_CONTENT_TYPE,
            Payload::Structured(_) => JSON_CONTENT_TYPE,
        }
    }

    /// Encode into a wire message tagged with its content type.
    pub fn into_message(self) -> Result<OutboundMessage, serde_json::Error> {
        let content_type = self.content_type();
        let data = self.encode()?;
        Ok(OutboundMessage::new(data).with_attribute(CONTENT_TYPE_ATTRIBUTE, content_type))
    }

    /// Encode for the wire. Non-ASCII characters are written as UTF-8, not escaped.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Structured(value) => serde_json::to_vec(value),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Payload::Structured(value) => Some(value),
            _ => None,
        }
    }

    /// Look up a top-level field of a structured record.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_structured().and_then(|value| value.get(name))
    }

    /// The correlation id embedded in a structured record, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.field(MESSAGE_ID_FIELD).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(bytes) => bytes.len(),
            Payload::Text(text) => text.len(),
            Payload::Structured(value) => value.to_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Payload::Text(text) => f.write_str(text),
            Payload::Structured(value) => write!(f, "{value}"),
        }
    }
}

// Bytes are rendered as base64 so results stay valid JSON.
impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Bytes(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            Payload::Text(text) => serializer.serialize_str(text),
            Payload::Structured(value) => value.serialize(serializer),
        }
    }
}

/// An outbound payload tagged with an application-assigned message id.
///
/// The transport never interprets the id; it exists for correlation and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    pub message_id: String,
    pub payload: Payload,
}

impl OutboundEnvelope {
    /// Wrap a payload under a fresh random id.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::with_message_id(Uuid::new_v4().to_string(), payload)
    }

    pub fn with_message_id(message_id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            message_id: message_id.into(),
            payload: payload.into(),
        }
    }

    /// Build the wire message.
    ///
    /// Records get the id as a `message_id` field (an existing field is kept).
    /// Text and non-record values are wrapped as `{"message": .., "message_id": ..}`.
    /// Raw bytes are sent untouched. The id and content type are always set
    /// as attributes too.
    pub fn into_message(self) -> Result<OutboundMessage, serde_json::Error> {
        let content_type = match self.payload {
            Payload::Bytes(_) => BYTES_CONTENT_TYPE,
            _ => JSON_CONTENT_TYPE,
        };
        let data = match self.payload {
            Payload::Bytes(bytes) => bytes,
            Payload::Structured(Value::Object(mut record)) => {
                record
                    .entry(MESSAGE_ID_FIELD)
                    .or_insert_with(|| Value::String(self.message_id.clone()));
                serde_json::to_vec(&Value::Object(record))?
            }
            Payload::Structured(value) => serde_json::to_vec(&wrap(value, &self.message_id))?,
            Payload::Text(text) => {
                serde_json::to_vec(&wrap(Value::String(text), &self.message_id))?
            }
        };
        let mut attributes = Attributes::new();
        attributes.insert(MESSAGE_ID_ATTRIBUTE.to_string(), self.message_id);
        attributes.insert(CONTENT_TYPE_ATTRIBUTE.to_string(), content_type.to_string());
        Ok(OutboundMessage { data, attributes })
    }
}

fn wrap(value: Value, message_id: &str) -> Value {
    let mut record = Map::new();
    record.insert(MESSAGE_FIELD.to_string(), value);
    record.insert(
        MESSAGE_ID_FIELD.to_string(),
        Value::String(message_id.to_string()),
    );
    Value::Object(record)
}
