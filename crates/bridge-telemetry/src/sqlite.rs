use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::records::{LogRecord, RecordSink, Severity};

/// A record as read back from the database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub timestamp: String,
    pub severity: String,
    pub connection_id: Option<String>,
    pub conversation_id: Option<String>,
    pub op: String,
    pub payload: String,
}

impl StoredRecord {
    /// Payload parsed back into JSON. `None` if the stored text is not JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.payload).ok()
    }
}

/// Filter for [`SqliteRecordSink::query`]. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct RecordQuery {
    pub conversation_id: Option<String>,
    pub op: Option<String>,
    pub severity: Option<Severity>,
    /// RFC 3339 lower bound on the record timestamp.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Persists every record to SQLite so records can be grouped by conversation later.
pub struct SqliteRecordSink {
    conn: Mutex<Connection>,
}

impl SqliteRecordSink {
    /// Open (or create) the records database at `db_path` and apply the schema.
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS records (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 severity TEXT NOT NULL,
                 connection_id TEXT,
                 conversation_id TEXT,
                 op TEXT NOT NULL,
                 payload TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_records_conversation ON records(conversation_id);
             CREATE INDEX IF NOT EXISTS idx_records_timestamp ON records(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Records matching `q`, newest first.
    pub fn query(&self, q: &RecordQuery) -> Result<Vec<StoredRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, severity, connection_id, conversation_id, op, payload FROM records WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(conversation_id) = &q.conversation_id {
            sql.push_str(&format!(" AND conversation_id = ?{}", params.len() + 1));
            params.push(Box::new(conversation_id.clone()));
        }
        if let Some(op) = &q.op {
            sql.push_str(&format!(" AND op = ?{}", params.len() + 1));
            params.push(Box::new(op.clone()));
        }
        if let Some(severity) = q.severity {
            sql.push_str(&format!(" AND severity = ?{}", params.len() + 1));
            params.push(Box::new(severity.as_str()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(StoredRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                severity: row.get(2)?,
                connection_id: row.get(3)?,
                conversation_id: row.get(4)?,
                op: row.get(5)?,
                payload: row.get(6)?,
            })
        })?;
        rows.collect()
    }

    /// Total number of stored records.
    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
    }
}

impl RecordSink for SqliteRecordSink {
    fn record(&self, record: &LogRecord) {
        let conn = self.conn.lock();
        // Insert failures are dropped; the sink never fails toward the caller.
        let _ = conn.execute(
            "INSERT INTO records (timestamp, severity, connection_id, conversation_id, op, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.timestamp.to_rfc3339(),
                record.severity.as_str(),
                record.connection_id.as_ref().map(|c| c.as_str().to_string()),
                record.conversation_id.as_ref().map(|c| c.as_str().to_string()),
                record.op,
                record.payload.to_string(),
            ],
        );
    }
}
