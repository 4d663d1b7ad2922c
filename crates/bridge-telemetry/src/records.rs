use std::fmt;
use std::sync::Arc;

use bridge_core::ids::{ConnectionId, ConversationId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target used for every record emitted through [`TracingSink`].
pub const RECORD_TARGET: &str = "bridge::records";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operational record. Append-only: never mutated after it is emitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub connection_id: Option<ConnectionId>,
    pub conversation_id: Option<ConversationId>,
    pub op: String,
    pub payload: Value,
}

impl LogRecord {
    /// Record stamped with the current time and no connection or conversation.
    pub fn new(severity: Severity, op: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            connection_id: None,
            conversation_id: None,
            op: op.into(),
            payload,
        }
    }

    pub fn info(op: impl Into<String>, payload: Value) -> Self {
        Self::new(Severity::Info, op, payload)
    }

    pub fn warn(op: impl Into<String>, payload: Value) -> Self {
        Self::new(Severity::Warn, op, payload)
    }

    pub fn error(op: impl Into<String>, payload: Value) -> Self {
        Self::new(Severity::Error, op, payload)
    }

    #[must_use]
    pub fn with_connection(mut self, connection_id: &ConnectionId) -> Self {
        self.connection_id = Some(connection_id.clone());
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: Option<&ConversationId>) -> Self {
        self.conversation_id = conversation_id.cloned();
        self
    }
}

/// Destination for structured records.
///
/// Implementations must tolerate concurrent calls and must never panic or
/// surface failures to the caller.
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &LogRecord);
}

/// Cloneable handle to the process-wide record sink.
///
/// A logger may be scoped to one connection with [`StructuredLogger::for_connection`];
/// every record it emits is then stamped with that connection id.
#[derive(Clone)]
pub struct StructuredLogger {
    sink: Arc<dyn RecordSink>,
    connection_id: Option<ConnectionId>,
}

impl StructuredLogger {
    /// Logger writing into `sink`, not scoped to any connection.
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink,
            connection_id: None,
        }
    }

    /// Logger that forwards records into the `tracing` subscriber.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    #[must_use]
    pub fn for_connection(&self, connection_id: &ConnectionId) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            connection_id: Some(connection_id.clone()),
        }
    }

    /// Stamp the logger's connection id onto `record` (unless it has one) and hand it to the sink.
    pub fn emit(&self, mut record: LogRecord) {
        if record.connection_id.is_none() {
            record.connection_id.clone_from(&self.connection_id);
        }
        self.sink.record(&record);
    }

    /// Emit an info record for `op`.
    pub fn info(&self, op: &str, conversation_id: Option<&ConversationId>, payload: Value) {
        self.emit(LogRecord::info(op, payload).with_conversation(conversation_id));
    }

    /// Emit a warning record for `op`.
    pub fn warn(&self, op: &str, conversation_id: Option<&ConversationId>, payload: Value) {
        self.emit(LogRecord::warn(op, payload).with_conversation(conversation_id));
    }

    /// Emit an error record for `op`.
    pub fn error(&self, op: &str, conversation_id: Option<&ConversationId>, payload: Value) {
        self.emit(LogRecord::error(op, payload).with_conversation(conversation_id));
    }
}

impl fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredLogger").finish_non_exhaustive()
    }
}

/// Emits each record as a single `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn record(&self, record: &LogRecord) {
        let timestamp = record.timestamp.to_rfc3339();
        let connection_id = record.connection_id.as_ref().map(ConnectionId::as_str);
        let conversation_id = record.conversation_id.as_ref().map(ConversationId::as_str);
        let payload = record.payload.to_string();
        let op = record.op.as_str();

        match record.severity {
            Severity::Info => tracing::info!(
                target: RECORD_TARGET,
                timestamp = %timestamp,
                connection_id,
                conversation_id,
                op,
                payload = %payload,
            ),
            Severity::Warn => tracing::warn!(
                target: RECORD_TARGET,
                timestamp = %timestamp,
                connection_id,
                conversation_id,
                op,
                payload = %payload,
            ),
            Severity::Error => tracing::error!(
                target: RECORD_TARGET,
                timestamp = %timestamp,
                connection_id,
                conversation_id,
                op,
                payload = %payload,
            ),
        }
    }
}

/// Keeps every record in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Recorded entries whose op equals `op`, in emission order.
    pub fn with_op(&self, op: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.op == op)
            .cloned()
            .collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RecordSink for MemorySink {
    fn record(&self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Writes each record to several sinks, in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl FanoutSink {
    /// Fan out to every sink in `sinks`.
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }

    /// Add another sink.
    pub fn push(&mut self, sink: Arc<dyn RecordSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl RecordSink for FanoutSink {
    fn record(&self, record: &LogRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}
