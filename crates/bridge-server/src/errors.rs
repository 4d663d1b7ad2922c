use bridge_core::errors::PipelineError;

use crate::connection::ConnectionError;

/// Failures that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("pipeline failed: {0}")]
    Pipeline(#[source] PipelineError),
    #[error("write failed: {0}")]
    Write(#[source] ConnectionError),
    #[error("receive failed: {0}")]
    Receive(#[source] ConnectionError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server shutting down")]
    Shutdown,
}

impl SessionError {
    /// Short kind label written into `session.error` records.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Pipeline(_) => "pipeline",
            Self::Write(_) => "write",
            Self::Receive(_) => "receive",
            Self::Encode(_) => "encode",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Per-frame failures. The session logs them and keeps reading.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{0}")]
    Decode(String),
    #[error("message frame without a conversation id")]
    MissingConversation,
}

impl FrameError {
    /// Record op this failure is logged under.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Decode(_) => "frame.decode_error",
            Self::MissingConversation => "frame.missing_conversation",
        }
    }
}
