//! Pipeline event to wire frame mapping.
//!
//! | event            | frame                  | record                    |
//! |------------------|------------------------|---------------------------|
//! | token, non-empty | `on_chat_model_stream` | none                      |
//! | token, empty     | none                   | none                      |
//! | model end        | `on_chat_model_end`    | transcript so far         |
//! | custom           | `{name: data}`         | the same `{name: data}`   |
//! | anything else    | none                   | none                      |

use bridge_core::events::{PipelineEvent, CHAT_MODEL_END, CUSTOM_EVENT};
use bridge_core::ids::ConversationId;
use bridge_core::protocol::OutboundMessage;
use bridge_telemetry::LogRecord;
use serde_json::Value;

/// Append-only buffer of streamed fragments for one invocation.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    fragments: Vec<String>,
}

impl Transcript {
    /// Empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one streamed fragment.
    pub fn push(&mut self, fragment: &str) {
        self.fragments.push(fragment.to_string());
    }

    /// Fragments concatenated in arrival order.
    pub fn joined(&self) -> String {
        self.fragments.concat()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(String::is_empty)
    }
}

/// What one event produces: at most one frame and at most one record.
#[derive(Debug, Default)]
pub struct Translation {
    pub outbound: Option<OutboundMessage>,
    pub record: Option<LogRecord>,
}

/// Map one pipeline event to its outbound frame and log record.
///
/// Stream chunks also accumulate into `transcript`, and the end event logs
/// the joined transcript. Empty chunks produce no frame.
pub fn translate(
    event: &PipelineEvent,
    conversation_id: &ConversationId,
    transcript: &mut Transcript,
) -> Translation {
    match event {
        PipelineEvent::ChatModelStream { chunk } => {
            transcript.push(chunk);
            Translation {
                outbound: (!chunk.is_empty()).then(|| OutboundMessage::StreamToken(chunk.clone())),
                record: None,
            }
        }
        PipelineEvent::ChatModelEnd => Translation {
            outbound: Some(OutboundMessage::StreamEnd),
            record: Some(
                LogRecord::info(CHAT_MODEL_END, Value::String(transcript.joined()))
                    .with_conversation(Some(conversation_id)),
            ),
        },
        PipelineEvent::Custom { name, data } => {
            let outbound = OutboundMessage::CustomEvent {
                name: name.clone(),
                data: data.clone(),
            };
            let record = LogRecord::info(CUSTOM_EVENT, outbound.to_value())
                .with_conversation(Some(conversation_id));
            Translation {
                outbound: Some(outbound),
                record: Some(record),
            }
        }
        PipelineEvent::Other { .. } => Translation::default(),
    }
}
