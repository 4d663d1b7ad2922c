use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::errors::PipelineError;
use bridge_core::events::PipelineEvent;
use bridge_core::ids::ConversationId;
use bridge_core::pipeline::{EventStream, Pipeline, PipelineInput, RunConfig};
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use crate::graph::{CHAIN_END, CHAIN_START, CHAT_MODEL_START};

/// Pre-programmed outcome of one `stream_events` call.
#[derive(Clone, Debug)]
pub enum ScriptedRun {
    /// Yield these events, then end.
    Events(Vec<PipelineEvent>),
    /// Fail the `stream_events` call itself.
    Fail(PipelineError),
    /// Yield these events, then a stream error.
    FailAfter(Vec<PipelineEvent>, PipelineError),
    /// Wait before each event.
    Paced(Duration, Vec<PipelineEvent>),
    /// Yield these events, then never end.
    Hang(Vec<PipelineEvent>),
}

impl ScriptedRun {
    /// A full model turn streaming `fragments`, framed by the usual lifecycle events.
    pub fn reply(fragments: &[&str]) -> Self {
        Self::Events(reply_events(fragments))
    }
}

/// Lifecycle events around a model turn that streams `fragments`.
pub fn reply_events(fragments: &[&str]) -> Vec<PipelineEvent> {
    let mut events = vec![
        PipelineEvent::other(CHAIN_START),
        PipelineEvent::other(CHAT_MODEL_START),
    ];
    events.extend(fragments.iter().map(|f| PipelineEvent::token(*f)));
    events.push(PipelineEvent::ChatModelEnd);
    events.push(PipelineEvent::other(CHAIN_END));
    events
}

/// One observed call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    pub messages: Vec<String>,
    pub thread_id: ConversationId,
}

/// Pipeline double that replays scripted runs in order.
///
/// Once the script is exhausted, further calls fail with `InvalidInput`.
#[derive(Debug, Default)]
pub struct ScriptedPipeline {
    runs: Mutex<VecDeque<ScriptedRun>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedPipeline {
    /// Pipeline that plays `runs` back in order, one per invocation.
    pub fn new(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue another run behind the existing ones.
    pub fn push(&self, run: ScriptedRun) {
        self.runs.lock().push_back(run);
    }

    /// Inputs received so far, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// How many times the pipeline was invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_events(
        &self,
        input: PipelineInput,
        config: RunConfig,
    ) -> Result<EventStream, PipelineError> {
        let idx = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                messages: input.messages,
                thread_id: config.configurable.thread_id,
            });
            calls.len() - 1
        };
        let run = self.runs.lock().pop_front().ok_or_else(|| {
            PipelineError::InvalidInput(format!("no scripted run for call {idx}"))
        })?;

        let stream: EventStream = match run {
            ScriptedRun::Events(events) => {
                Box::pin(stream::iter(events.into_iter().map(Ok::<_, PipelineError>)))
            }
            ScriptedRun::Fail(e) => return Err(e),
            ScriptedRun::FailAfter(events, e) => Box::pin(
                stream::iter(events.into_iter().map(Ok::<_, PipelineError>))
                    .chain(stream::once(async move { Err(e) })),
            ),
            ScriptedRun::Paced(delay, events) => {
                Box::pin(stream::iter(events).then(move |evt| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, PipelineError>(evt)
                }))
            }
            ScriptedRun::Hang(events) => Box::pin(
                stream::iter(events.into_iter().map(Ok::<_, PipelineError>))
                    .chain(stream::pending()),
            ),
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(stream: EventStream) -> Vec<Result<PipelineEvent, PipelineError>> {
        stream.collect().await
    }

    fn cfg(id: &str) -> RunConfig {
        RunConfig::for_thread(ConversationId::from_raw(id))
    }

    #[tokio::test]
    async fn replays_runs_in_order_and_records_calls() {
        let pipeline = ScriptedPipeline::new([
            ScriptedRun::reply(&["Hi"]),
            ScriptedRun::Fail(PipelineError::Model("down".into())),
        ]);

        let events = drain(
            pipeline
                .stream_events(PipelineInput::message("one"), cfg("a1"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events.len(), 5);

        let second = pipeline
            .stream_events(PipelineInput::message("two"), cfg("a1"))
            .await;
        assert!(matches!(second, Err(PipelineError::Model(_))));

        let third = pipeline
            .stream_events(PipelineInput::message("three"), cfg("b2"))
            .await;
        assert!(matches!(third, Err(PipelineError::InvalidInput(_))));

        let calls = pipeline.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].messages, vec!["one".to_string()]);
        assert_eq!(calls[2].thread_id, ConversationId::from_raw("b2"));
    }

    #[tokio::test]
    async fn fail_after_yields_events_then_error() {
        let pipeline = ScriptedPipeline::new([ScriptedRun::FailAfter(
            vec![PipelineEvent::token("a")],
            PipelineError::Stream("cut".into()),
        )]);
        let events = drain(
            pipeline
                .stream_events(PipelineInput::message("x"), cfg("a1"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(PipelineError::Stream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn paced_run_waits_between_events() {
        let pipeline = ScriptedPipeline::new([ScriptedRun::Paced(
            Duration::from_secs(1),
            vec![PipelineEvent::token("a"), PipelineEvent::token("b")],
        )]);
        let start = tokio::time::Instant::now();
        let events = drain(
            pipeline
                .stream_events(PipelineInput::message("x"), cfg("a1"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn hang_never_finishes() {
        let pipeline = ScriptedPipeline::new([ScriptedRun::Hang(vec![PipelineEvent::token("a")])]);
        let mut stream = pipeline
            .stream_events(PipelineInput::message("x"), cfg("a1"))
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        let next = tokio::time::timeout(Duration::from_secs(60), stream.next()).await;
        assert!(next.is_err());
    }

    #[test]
    fn reply_events_shape() {
        let kinds: Vec<_> = reply_events(&["a", "b"])
            .iter()
            .map(|e| e.kind().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "on_chain_start",
                "on_chat_model_start",
                "on_chat_model_stream",
                "on_chat_model_stream",
                "on_chat_model_end",
                "on_chain_end",
            ]
        );
    }
}
