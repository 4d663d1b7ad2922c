use std::sync::Arc;

use async_trait::async_trait;
use bridge_core::errors::PipelineError;
use bridge_core::events::PipelineEvent;
use bridge_core::ids::ConversationId;
use bridge_core::pipeline::{EventStream, Pipeline, PipelineInput, RunConfig};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use crate::checkpoint::{ChatMessage, MemoryCheckpointer};
use crate::model::ChatModel;

pub const CHAIN_START: &str = "on_chain_start";
pub const CHAIN_END: &str = "on_chain_end";
pub const CHAT_MODEL_START: &str = "on_chat_model_start";

const EVENT_BUFFER: usize = 32;

/// Node settings for [`ConversationGraph`].
#[derive(Clone, Debug)]
pub struct GraphConfig {
    /// Substrings checked against the latest message.
    pub keywords: Vec<String>,
    /// Custom event dispatched (with data `true`) on a keyword hit.
    pub custom_event: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            keywords: [
                "LangChain",
                "langchain",
                "Langchain",
                "LangGraph",
                "Langgraph",
                "langgraph",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            custom_event: "on_easter_egg".to_string(),
        }
    }
}

/// Case-sensitive substring match of any keyword.
pub fn keyword_hit(message: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|k| !k.is_empty() && message.contains(k.as_str()))
}

/// Two-node conversation pipeline: keyword check, then the chat model.
///
/// History is kept per thread id in a [`MemoryCheckpointer`] and handed to
/// the model on every run. A run that fails leaves the history untouched.
pub struct ConversationGraph<M: ChatModel> {
    model: Arc<M>,
    checkpointer: Arc<MemoryCheckpointer>,
    config: GraphConfig,
}

impl<M: ChatModel> ConversationGraph<M> {
    /// Graph over `model` with a fresh in-memory checkpointer.
    pub fn new(model: M, config: GraphConfig) -> Self {
        Self::with_checkpointer(model, config, Arc::new(MemoryCheckpointer::new()))
    }

    /// Graph sharing an existing checkpointer, so history survives rebuilding the graph.
    pub fn with_checkpointer(
        model: M,
        config: GraphConfig,
        checkpointer: Arc<MemoryCheckpointer>,
    ) -> Self {
        Self {
            model: Arc::new(model),
            checkpointer,
            config,
        }
    }

    /// The checkpointer holding per-thread history.
    pub fn checkpointer(&self) -> &Arc<MemoryCheckpointer> {
        &self.checkpointer
    }
}

#[async_trait]
impl<M: ChatModel> Pipeline for ConversationGraph<M> {
    fn name(&self) -> &str {
        "conversation_graph"
    }

    #[instrument(skip_all, fields(thread_id = %config.thread_id(), model = self.model.name()))]
    async fn stream_events(
        &self,
        input: PipelineInput,
        config: RunConfig,
    ) -> Result<EventStream, PipelineError> {
        if input.latest().is_none() {
            return Err(PipelineError::InvalidInput("no messages".into()));
        }

        let run = GraphRun {
            model: Arc::clone(&self.model),
            checkpointer: Arc::clone(&self.checkpointer),
            config: self.config.clone(),
            thread_id: config.configurable.thread_id,
            messages: input.messages,
        };
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run.drive(tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

type EventSender = mpsc::Sender<Result<PipelineEvent, PipelineError>>;

/// One run, owned by its producer task.
struct GraphRun<M: ChatModel> {
    model: Arc<M>,
    checkpointer: Arc<MemoryCheckpointer>,
    config: GraphConfig,
    thread_id: ConversationId,
    messages: Vec<String>,
}

impl<M: ChatModel> GraphRun<M> {
    async fn drive(self, tx: EventSender) {
        match self.execute(&tx).await {
            Ok(()) => {}
            // Consumer is gone; nobody to tell.
            Err(PipelineError::Cancelled) => {
                debug!(thread_id = %self.thread_id, "graph run abandoned by consumer");
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
            }
        }
    }

    async fn execute(&self, tx: &EventSender) -> Result<(), PipelineError> {
        emit(tx, PipelineEvent::other(CHAIN_START)).await?;

        let latest = self.messages.last().map(String::as_str).unwrap_or_default();
        if keyword_hit(latest, &self.config.keywords) {
            emit(
                tx,
                PipelineEvent::custom(self.config.custom_event.clone(), Value::Bool(true)),
            )
            .await?;
        }

        let turn: Vec<ChatMessage> = self.messages.iter().map(ChatMessage::user).collect();
        let mut history = self.checkpointer.history(&self.thread_id);
        history.extend(turn.iter().cloned());

        emit(tx, PipelineEvent::other(CHAT_MODEL_START)).await?;
        let mut fragments = self.model.stream_chat(&history).await?;
        let mut reply = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            reply.push_str(&fragment);
            emit(tx, PipelineEvent::token(fragment)).await?;
        }
        emit(tx, PipelineEvent::ChatModelEnd).await?;

        self.checkpointer.append(
            &self.thread_id,
            turn.into_iter().chain(std::iter::once(ChatMessage::assistant(reply))),
        );
        emit(tx, PipelineEvent::other(CHAIN_END)).await
    }
}

async fn emit(tx: &EventSender, event: PipelineEvent) -> Result<(), PipelineError> {
    tx.send(Ok(event))
        .await
        .map_err(|_| PipelineError::Cancelled)
}
