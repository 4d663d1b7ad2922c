use serde_json::Value;

pub const CHAT_MODEL_STREAM: &str = "on_chat_model_stream";
pub const CHAT_MODEL_END: &str = "on_chat_model_end";
pub const CUSTOM_EVENT: &str = "on_custom_event";

/// One unit emitted by a pipeline during an invocation.
///
/// Pipelines emit many kinds of lifecycle events (chain start/end, model start,
/// ...). Only token fragments, model completion and custom events reach the
/// client; everything else lands in `Other`.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// An incremental token fragment from the chat model. May be empty.
    ChatModelStream { chunk: String },
    /// The chat model finished generating.
    ChatModelEnd,
    /// A named event dispatched from inside the pipeline.
    Custom { name: String, data: Value },
    /// Any other lifecycle event.
    Other { kind: String, data: Value },
}

impl PipelineEvent {
    /// A streamed model fragment.
    pub fn token(chunk: impl Into<String>) -> Self {
        Self::ChatModelStream { chunk: chunk.into() }
    }

    /// A named custom event.
    pub fn custom(name: impl Into<String>, data: Value) -> Self {
        Self::Custom {
            name: name.into(),
            data,
        }
    }

    /// An event the bridge does not act on.
    pub fn other(kind: impl Into<String>) -> Self {
        Self::Other {
            kind: kind.into(),
            data: Value::Null,
        }
    }

    /// The event's kind name, as it appears in logs.
    pub fn kind(&self) -> &str {
        match self {
            Self::ChatModelStream { .. } => CHAT_MODEL_STREAM,
            Self::ChatModelEnd => CHAT_MODEL_END,
            Self::Custom { .. } => CUSTOM_EVENT,
            Self::Other { kind, .. } => kind,
        }
    }
}
