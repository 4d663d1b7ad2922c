use std::time::Duration;

/// Failures raised by a pipeline while starting or producing events.
///
/// The bridge never retries these; classification exists for the pipeline's
/// own model clients and for logging.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("model error: {0}")]
    Model(String),
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether retrying the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Network(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Model(_) => "model",
            Self::Http { .. } => "http",
            Self::Network(_) => "network",
            Self::Stream(_) => "stream",
            Self::InvalidInput(_) => "invalid_input",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
