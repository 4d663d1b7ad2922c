use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::events::PipelineEvent;
use crate::ids::ConversationId;

/// Lazy, finite, non-restartable sequence of pipeline events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<PipelineEvent, PipelineError>> + Send>>;

/// Input handed to a pipeline run: `{messages: [input]}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInput {
    pub messages: Vec<String>,
}

impl PipelineInput {
    /// Input carrying one user message.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            messages: vec![text.into()],
        }
    }

    /// The most recent message, used by nodes that inspect the latest turn.
    pub fn latest(&self) -> Option<&str> {
        self.messages.last().map(String::as_str)
    }
}

/// Per-run configuration: `{configurable: {thread_id: conversation_id}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub configurable: Configurable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configurable {
    pub thread_id: ConversationId,
}

impl RunConfig {
    /// Run configuration for conversation `thread_id`.
    pub fn for_thread(thread_id: ConversationId) -> Self {
        Self {
            configurable: Configurable { thread_id },
        }
    }

    /// The conversation this run belongs to.
    pub fn thread_id(&self) -> &ConversationId {
        &self.configurable.thread_id
    }
}

/// An event-producing generative pipeline.
///
/// The pipeline owns its own memory/checkpointing keyed by the run's thread id,
/// and any retry policy for the models it calls.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_events(
        &self,
        input: PipelineInput,
        config: RunConfig,
    ) -> Result<EventStream, PipelineError>;
}
