//! Wire protocol between the bridge and its clients.
//!
//! Inbound: `{"uuid": "...", "message": "...", "init": bool}`.
//! Outbound: a single-key object `{tag: payload}` per frame.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::events::{CHAT_MODEL_END, CHAT_MODEL_STREAM};
use crate::ids::ConversationId;

/// A decoded client frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub init: bool,
}

/// What a frame asks the bridge to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameIntent<'a> {
    /// Session initialization. Never starts an invocation.
    Init,
    /// Run the pipeline on this message.
    Message(&'a str),
    /// Neither init nor a non-empty message.
    Empty,
}

impl InboundFrame {
    /// Parse one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The conversation identifier carried by this frame, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.uuid
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(ConversationId::from_raw)
    }

    /// `init` wins over any other field present.
    pub fn intent(&self) -> FrameIntent<'_> {
        if self.init {
            return FrameIntent::Init;
        }
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => FrameIntent::Message(m),
            _ => FrameIntent::Empty,
        }
    }
}

/// A frame sent to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    StreamToken(String),
    StreamEnd,
    CustomEvent { name: String, data: Value },
}

impl OutboundMessage {
    /// The single key this frame is serialized under.
    pub fn tag(&self) -> &str {
        match self {
            Self::StreamToken(_) => CHAT_MODEL_STREAM,
            Self::StreamEnd => CHAT_MODEL_END,
            Self::CustomEvent { name, .. } => name,
        }
    }

    /// Value carried under [`tag`](Self::tag).
    pub fn payload(&self) -> Value {
        match self {
            Self::StreamToken(text) => Value::String(text.clone()),
            Self::StreamEnd => Value::Bool(true),
            Self::CustomEvent { data, .. } => data.clone(),
        }
    }

    /// The frame as a JSON value, `{tag: payload}`.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(self.tag().to_string(), self.payload());
        Value::Object(map)
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for OutboundMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::StreamToken(text) => map.serialize_entry(CHAT_MODEL_STREAM, text)?,
            Self::StreamEnd => map.serialize_entry(CHAT_MODEL_END, &true)?,
            Self::CustomEvent { name, data } => map.serialize_entry(name, data)?,
        }
        map.end()
    }
}
