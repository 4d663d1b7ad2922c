//! One duplex connection from accept to close.
//!
//! Frames are handled strictly in order: a message frame runs its invocation
//! to completion before the next frame is read. Decode problems are logged
//! and skipped; anything else ends the session. Teardown closes the
//! connection once and always writes a `session.close` record.

use std::sync::Arc;

use bridge_core::ids::{ConnectionId, ConversationId};
use bridge_core::pipeline::Pipeline;
use bridge_core::protocol::{FrameIntent, InboundFrame};
use bridge_telemetry::StructuredLogger;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::connection::{Connection, ConnectionError, Frame};
use crate::errors::{FrameError, SessionError};
use crate::invocation::{Invocation, InvocationSummary};
use crate::registry::SessionRegistry;

pub const SESSION_ACCEPT: &str = "session.accept";
pub const SESSION_INIT: &str = "session.init";
pub const SESSION_ERROR: &str = "session.error";
pub const SESSION_CLOSE: &str = "session.close";
pub const SESSION_CLOSE_AFTER_CLOSE: &str = "session.close_after_close";
pub const SESSION_CLOSE_FAILED: &str = "session.close_failed";
pub const FRAME_IGNORED: &str = "frame.ignored";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Everything a session shares with the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub pipeline: Arc<dyn Pipeline>,
    pub logger: StructuredLogger,
    pub registry: Arc<SessionRegistry>,
    pub shutdown: CancellationToken,
}

impl SessionContext {
    /// Bundle the shared pieces every session needs.
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        logger: StructuredLogger,
        registry: Arc<SessionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            logger,
            registry,
            shutdown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Fatal(String),
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Fatal(_) => "fatal",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub frames_received: usize,
    pub invocations: usize,
    pub decode_errors: usize,
    pub close_reason: CloseReason,
}

#[derive(Debug)]
pub enum FrameAction {
    Initialized,
    Ignored,
    Invoked(InvocationSummary),
}

/// Result of handling one frame, matched by the session loop.
#[derive(Debug)]
pub enum FrameOutcome {
    Handled(FrameAction),
    Recoverable(FrameError),
    Fatal(SessionError),
}

pub struct Session<C: Connection> {
    conn: C,
    connection_id: ConnectionId,
    pipeline: Arc<dyn Pipeline>,
    logger: StructuredLogger,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    state: SessionState,
    last_conversation: Option<ConversationId>,
    frames_received: usize,
    invocations: usize,
    decode_errors: usize,
}

impl<C: Connection> Session<C> {
    /// Register a new connection and log `session.accept`.
    ///
    /// The session does nothing further until [`run`](Self::run) is awaited.
    pub fn accept(conn: C, ctx: SessionContext) -> Self {
        let connection_id = ConnectionId::new();
        let logger = ctx.logger.for_connection(&connection_id);
        ctx.registry.register(&connection_id);
        logger.info(
            SESSION_ACCEPT,
            None,
            json!({"pipeline": ctx.pipeline.name()}),
        );
        Self {
            conn,
            connection_id,
            pipeline: ctx.pipeline,
            logger,
            registry: ctx.registry,
            shutdown: ctx.shutdown,
            state: SessionState::Open,
            last_conversation: None,
            frames_received: 0,
            invocations: 0,
            decode_errors: 0,
        }
    }

    /// Identifier assigned at accept.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Conversation id most recently named by the client.
    pub fn last_conversation(&self) -> Option<&ConversationId> {
        self.last_conversation.as_ref()
    }

    #[instrument(skip_all, fields(connection_id = %self.connection_id))]
    pub async fn run(mut self) -> SessionReport {
        let close_reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                next = self.conn.recv_frame() => Some(next),
            };
            let frame = match next {
                None => break CloseReason::Shutdown,
                Some(None) => break CloseReason::ClientClosed,
                Some(Some(Err(e))) => {
                    let err = SessionError::Receive(e);
                    self.log_fatal(&err);
                    break CloseReason::Fatal(err.to_string());
                }
                Some(Some(Ok(frame))) => frame,
            };
            self.frames_received += 1;

            match self.handle_frame(frame).await {
                FrameOutcome::Handled(FrameAction::Invoked(summary)) => {
                    self.invocations += 1;
                    debug!(
                        frames_sent = summary.frames_sent,
                        completed = summary.completed,
                        "invocation finished"
                    );
                }
                FrameOutcome::Handled(_) => {}
                FrameOutcome::Recoverable(err) => {
                    if matches!(err, FrameError::Decode(_)) {
                        self.decode_errors += 1;
                    }
                    self.logger.error(
                        err.op(),
                        self.last_conversation.as_ref(),
                        json!({"error": err.to_string()}),
                    );
                }
                FrameOutcome::Fatal(SessionError::Shutdown) => break CloseReason::Shutdown,
                FrameOutcome::Fatal(err) => {
                    self.log_fatal(&err);
                    break CloseReason::Fatal(err.to_string());
                }
            }
        };

        self.close(&close_reason).await;
        SessionReport {
            frames_received: self.frames_received,
            invocations: self.invocations,
            decode_errors: self.decode_errors,
            close_reason,
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> FrameOutcome {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => return FrameOutcome::Recoverable(FrameError::Decode(e.to_string())),
            },
        };
        let inbound = match InboundFrame::decode(&text) {
            Ok(inbound) => inbound,
            Err(e) => return FrameOutcome::Recoverable(FrameError::Decode(e.to_string())),
        };

        if let Some(id) = inbound.conversation_id() {
            self.registry.set_conversation(&self.connection_id, &id);
            self.last_conversation = Some(id);
        }

        match inbound.intent() {
            FrameIntent::Init => {
                self.logger
                    .info(SESSION_INIT, self.last_conversation.as_ref(), json!({}));
                FrameOutcome::Handled(FrameAction::Initialized)
            }
            FrameIntent::Empty => {
                self.logger.info(
                    FRAME_IGNORED,
                    self.last_conversation.as_ref(),
                    json!({"uuid": inbound.uuid.as_deref(), "init": inbound.init}),
                );
                FrameOutcome::Handled(FrameAction::Ignored)
            }
            FrameIntent::Message(message) => {
                let Some(conversation_id) = self.last_conversation.clone() else {
                    return FrameOutcome::Recoverable(FrameError::MissingConversation);
                };
                let invocation = Invocation::new(
                    conversation_id,
                    self.pipeline.as_ref(),
                    &self.logger,
                    &self.shutdown,
                );
                match invocation.run(&mut self.conn, message.to_string()).await {
                    Ok(summary) => FrameOutcome::Handled(FrameAction::Invoked(summary)),
                    Err(err) => FrameOutcome::Fatal(err),
                }
            }
        }
    }

    fn log_fatal(&self, err: &SessionError) {
        self.logger.error(
            SESSION_ERROR,
            self.last_conversation.as_ref(),
            json!({"error": err.to_string(), "kind": err.error_kind()}),
        );
    }

    /// Close the connection once and write the closing record.
    async fn close(&mut self, reason: &CloseReason) {
        if self.state != SessionState::Open {
            return;
        }
        self.state = SessionState::Closing;
        match self.conn.close().await {
            Ok(()) => {}
            Err(ConnectionError::AlreadyClosed) => self.logger.warn(
                SESSION_CLOSE_AFTER_CLOSE,
                self.last_conversation.as_ref(),
                json!({}),
            ),
            Err(e) => self.logger.warn(
                SESSION_CLOSE_FAILED,
                self.last_conversation.as_ref(),
                json!({"error": e.to_string()}),
            ),
        }
        self.finish(reason.as_str());
    }

    fn finish(&mut self, reason: &str) {
        self.logger.info(
            SESSION_CLOSE,
            self.last_conversation.as_ref(),
            json!({
                "reason": reason,
                "frames_received": self.frames_received,
                "invocations": self.invocations,
            }),
        );
        self.registry.unregister(&self.connection_id);
        self.state = SessionState::Closed;
    }
}

impl<C: Connection> Drop for Session<C> {
    // Aborted sessions never reach `close`; the socket drops with us.
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.finish("aborted");
        }
    }
}
