use std::pin::Pin;

use async_trait::async_trait;
use bridge_core::errors::PipelineError;
use futures::{stream, Stream};

use crate::checkpoint::{ChatMessage, Role};

/// Incremental text fragments from a chat model.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, PipelineError>> + Send>>;

/// A streaming chat model. Retries, if any, are the model's own business.
#[async_trait]
pub trait ChatModel: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream, PipelineError>;
}

/// Deterministic local model: replies with the latest user message, one word per fragment.
#[derive(Clone, Debug, Default)]
pub struct EchoModel;

impl EchoModel {
    /// Echo model that splits input on word boundaries.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChatModel for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream, PipelineError> {
        let latest = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| PipelineError::InvalidInput("no user message".into()))?;
        let fragments = word_fragments(&latest.content);
        Ok(Box::pin(stream::iter(fragments.into_iter().map(Ok))))
    }
}

/// Split text into fragments that each end a word. Whitespace is kept and
/// attached to the word that follows it, so joining the fragments restores
/// the input exactly.
pub fn word_fragments(text: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_whitespace() && in_word {
            fragments.push(std::mem::take(&mut current));
            in_word = false;
        } else if !ch.is_whitespace() {
            in_word = true;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}
