//! # Event and Frame
//!
//! `Event` is the atomic unit the producer sends. `Frame` is one websocket data
//! message as the engine sees it, independent of whether it came through axum
//! (ingress) or tokio-tungstenite (providers).

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Sink, Stream};
use serde::de::{Error as _, Unexpected};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// A relayed event. Immutable once decoded; `id` uniqueness is not enforced.
/// Missing or `null` fields decode as empty strings, wrong types do not decode
/// at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(deserialize_with = "null_as_empty")]
    pub id: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub payload: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Decodes a raw ingress frame. Both text and binary frames are accepted as
    /// long as their bytes are a JSON object with string `id` and `payload`.
    /// A bare `null` decodes as the empty event; arrays and scalars are
    /// rejected.
    pub fn decode(frame: &Frame) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_slice(frame.as_bytes())?;
        match value {
            Value::Null => Ok(Event::default()),
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(serde_json::Error::invalid_type(unexpected(&other), &"a JSON object").into()),
        }
    }

    /// Re-serializes the event into the text frame sent while draining.
    pub fn to_frame(&self) -> Result<Frame, RelayError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(|e| RelayError::Encode {
                id: self.id.clone(),
                reason: e.to_string(),
            })
    }
}

fn unexpected(value: &Value) -> Unexpected<'_> {
    match value {
        Value::Null => Unexpected::Unit,
        Value::Bool(flag) => Unexpected::Bool(*flag),
        Value::Number(_) => Unexpected::Other("number"),
        Value::String(text) => Unexpected::Str(text),
        Value::Array(_) => Unexpected::Seq,
        Value::Object(_) => Unexpected::Map,
    }
}

/// One websocket data message. Control frames never reach the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Outbound half of a provider connection.
pub type BoxFrameSink = Pin<Box<dyn Sink<Frame, Error = RelayError> + Send>>;

/// Inbound half of the producer connection. `None` means the peer closed.
pub type BoxFrameStream = Pin<Box<dyn Stream<Item = Result<Frame, RelayError>> + Send>>;
