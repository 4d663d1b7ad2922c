use bridge_core::events::PipelineEvent;
use bridge_core::ids::ConversationId;
use bridge_core::pipeline::{Pipeline, PipelineInput, RunConfig};
use bridge_telemetry::StructuredLogger;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::connection::Connection;
use crate::errors::SessionError;
use crate::translator::{translate, Transcript};

pub const INVOCATION_START: &str = "invocation.start";

/// Final state of one completed invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationSummary {
    pub events: usize,
    pub frames_sent: usize,
    pub transcript: String,
    /// A model end event was seen.
    pub completed: bool,
}

/// One pipeline run for one inbound message.
///
/// Pulls events until the stream is exhausted, writing each translated frame
/// in pipeline order. Pipeline and write failures end the run and are
/// returned unretried. Shutdown is observed between events.
pub struct Invocation<'a> {
    conversation_id: ConversationId,
    pipeline: &'a dyn Pipeline,
    logger: &'a StructuredLogger,
    shutdown: &'a CancellationToken,
    transcript: Transcript,
    events: usize,
    frames_sent: usize,
    completed: bool,
}

impl<'a> Invocation<'a> {
    /// Prepare one pipeline run for `conversation_id`. Nothing happens until [`run`](Self::run).
    pub fn new(
        conversation_id: ConversationId,
        pipeline: &'a dyn Pipeline,
        logger: &'a StructuredLogger,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            conversation_id,
            pipeline,
            logger,
            shutdown,
            transcript: Transcript::new(),
            events: 0,
            frames_sent: 0,
            completed: false,
        }
    }

    #[instrument(skip_all, fields(conversation_id = %self.conversation_id, pipeline = self.pipeline.name()))]
    pub async fn run<C: Connection>(
        mut self,
        conn: &mut C,
        message: String,
    ) -> Result<InvocationSummary, SessionError> {
        self.logger.info(
            INVOCATION_START,
            Some(&self.conversation_id),
            json!({"pipeline": self.pipeline.name(), "message_len": message.len()}),
        );

        let input = PipelineInput::message(message);
        let config = RunConfig::for_thread(self.conversation_id.clone());
        let mut events = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
            started = self.pipeline.stream_events(input, config) => {
                started.map_err(SessionError::Pipeline)?
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
                next = events.next() => next,
            };
            let Some(event) = next else { break };
            let event = event.map_err(SessionError::Pipeline)?;
            self.events += 1;
            if matches!(event, PipelineEvent::ChatModelEnd) {
                self.completed = true;
            }

            let translation = translate(&event, &self.conversation_id, &mut self.transcript);
            if let Some(record) = translation.record {
                self.logger.emit(record);
            }
            if let Some(frame) = translation.outbound {
                let text = frame.to_text()?;
                conn.send_text(text).await.map_err(SessionError::Write)?;
                self.frames_sent += 1;
            }
        }

        debug!(
            events = self.events,
            frames_sent = self.frames_sent,
            "invocation drained"
        );
        Ok(InvocationSummary {
            events: self.events,
            frames_sent: self.frames_sent,
            transcript: self.transcript.joined(),
            completed: self.completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bridge_core::errors::PipelineError;
    use bridge_graph::{reply_events, ScriptedPipeline, ScriptedRun};
    use bridge_telemetry::{MemorySink, Severity};
    use serde_json::json;

    use super::*;
    use crate::connection::test_support::pair;

    struct Harness {
        pipeline: ScriptedPipeline,
        sink: Arc<MemorySink>,
        logger: StructuredLogger,
        shutdown: CancellationToken,
    }

    fn harness(runs: Vec<ScriptedRun>) -> Harness {
        let sink = Arc::new(MemorySink::new());
        Harness {
            pipeline: ScriptedPipeline::new(runs),
            logger: StructuredLogger::new(sink.clone()),
            sink,
            shutdown: CancellationToken::new(),
        }
    }

    impl Harness {
        fn invocation(&self, id: &str) -> Invocation<'_> {
            Invocation::new(
                ConversationId::from_raw(id),
                &self.pipeline,
                &self.logger,
                &self.shutdown,
            )
        }
    }

    #[tokio::test]
    async fn streams_tokens_then_end_in_order() {
        let h = harness(vec![ScriptedRun::reply(&["Hi", " there"])]);
        let (mut conn, peer) = pair();

        let summary = h
            .invocation("a1")
            .run(&mut conn, "hello".into())
            .await
            .unwrap();

        assert_eq!(
            peer.sent(),
            vec![
                r#"{"on_chat_model_stream":"Hi"}"#,
                r#"{"on_chat_model_stream":" there"}"#,
                r#"{"on_chat_model_end":true}"#,
            ]
        );
        assert_eq!(summary.frames_sent, 3);
        assert_eq!(summary.events, 6);
        assert_eq!(summary.transcript, "Hi there");
        assert!(summary.completed);

        let ends = h.sink.with_op("on_chat_model_end");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].payload, json!("Hi there"));
        assert_eq!(ends[0].conversation_id, Some(ConversationId::from_raw("a1")));
    }

    #[tokio::test]
    async fn passes_message_and_thread_id_to_pipeline() {
        let h = harness(vec![ScriptedRun::reply(&[])]);
        let (mut conn, _peer) = pair();
        h.invocation("thread-7")
            .run(&mut conn, "what's up".into())
            .await
            .unwrap();

        let calls = h.pipeline.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].messages, vec!["what's up".to_string()]);
        assert_eq!(calls[0].thread_id.as_str(), "thread-7");
        assert_eq!(h.sink.with_op(INVOCATION_START).len(), 1);
    }

    #[tokio::test]
    async fn empty_fragments_are_not_sent_but_stream_end_is() {
        let h = harness(vec![ScriptedRun::Events(vec![
            PipelineEvent::token(""),
            PipelineEvent::ChatModelEnd,
        ])]);
        let (mut conn, peer) = pair();
        let summary = h.invocation("a1").run(&mut conn, "x".into()).await.unwrap();
        assert_eq!(peer.sent(), vec![r#"{"on_chat_model_end":true}"#]);
        assert_eq!(summary.transcript, "");
        assert_eq!(h.sink.with_op("on_chat_model_end")[0].payload, json!(""));
    }

    #[tokio::test]
    async fn custom_event_is_sent_and_logged() {
        let mut events = vec![PipelineEvent::custom("on_easter_egg", json!(true))];
        events.extend(reply_events(&["ok"]));
        let h = harness(vec![ScriptedRun::Events(events)]);
        let (mut conn, peer) = pair();
        h.invocation("a1").run(&mut conn, "LangGraph".into()).await.unwrap();

        assert_eq!(peer.sent()[0], r#"{"on_easter_egg":true}"#);
        let customs = h.sink.with_op("on_custom_event");
        assert_eq!(customs.len(), 1);
        assert_eq!(customs[0].payload, json!({"on_easter_egg": true}));
        assert_eq!(customs[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn no_end_event_means_not_completed() {
        let h = harness(vec![ScriptedRun::Events(vec![PipelineEvent::token("partial")])]);
        let (mut conn, _peer) = pair();
        let summary = h.invocation("a1").run(&mut conn, "x".into()).await.unwrap();
        assert!(!summary.completed);
        assert!(h.sink.with_op("on_chat_model_end").is_empty());
    }

    #[tokio::test]
    async fn pipeline_start_failure_is_returned() {
        let h = harness(vec![ScriptedRun::Fail(PipelineError::Model("down".into()))]);
        let (mut conn, peer) = pair();
        let err = h.invocation("a1").run(&mut conn, "x".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Pipeline(PipelineError::Model(_))));
        assert!(peer.sent().is_empty());
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_frames_already_written() {
        let h = harness(vec![ScriptedRun::FailAfter(
            vec![PipelineEvent::token("Hi")],
            PipelineError::Stream("reset".into()),
        )]);
        let (mut conn, peer) = pair();
        let err = h.invocation("a1").run(&mut conn, "x".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Pipeline(PipelineError::Stream(_))));
        assert_eq!(peer.sent(), vec![r#"{"on_chat_model_stream":"Hi"}"#]);
    }

    #[tokio::test]
    async fn write_failure_stops_the_run() {
        let h = harness(vec![ScriptedRun::reply(&["a", "b", "c"])]);
        let (conn, peer) = pair();
        let mut conn = conn.fail_writes_after(1);
        let err = h.invocation("a1").run(&mut conn, "x".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Write(_)));
        assert_eq!(peer.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_hanging_pipeline() {
        let h = harness(vec![ScriptedRun::Hang(vec![PipelineEvent::token("a")])]);
        let (mut conn, peer) = pair();
        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        });

        let err = h.invocation("a1").run(&mut conn, "x".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Shutdown));
        assert_eq!(peer.sent().len(), 1);
    }
}
