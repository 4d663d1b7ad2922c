mod records;
mod sqlite;

pub use records::{
    FanoutSink, LogRecord, MemorySink, RecordSink, Severity, StructuredLogger, TracingSink,
    RECORD_TARGET,
};
pub use sqlite::{RecordQuery, SqliteRecordSink, StoredRecord};

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
    #[error("failed to open records database: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Console output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "bridge_graph" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
    /// Colourised console output. Only affects the pretty format.
    pub ansi: bool,
    /// Persist every structured record to this SQLite database.
    pub records_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
            ansi: false,
            records_db_path: None,
        }
    }
}

impl TelemetryConfig {
    fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Owns the process-wide structured logger. Keep it alive until exit.
pub struct TelemetryGuard {
    logger: StructuredLogger,
    records: Option<Arc<SqliteRecordSink>>,
}

impl TelemetryGuard {
    /// Logger bound to the sinks configured at init.
    pub fn logger(&self) -> StructuredLogger {
        self.logger.clone()
    }

    /// Access the records database, when one is configured.
    pub fn records(&self) -> Option<&SqliteRecordSink> {
        self.records.as_deref()
    }
}

/// Build the structured logger without touching the global subscriber.
///
/// Records always go to `tracing`; with a database path they are also persisted.
pub fn build_logger(
    config: &TelemetryConfig,
) -> Result<(StructuredLogger, Option<Arc<SqliteRecordSink>>), TelemetryError> {
    let Some(path) = &config.records_db_path else {
        return Ok((StructuredLogger::tracing(), None));
    };
    let sqlite = Arc::new(SqliteRecordSink::open(path)?);
    let fanout = FanoutSink::new(vec![Arc::new(TracingSink), sqlite.clone()]);
    Ok((StructuredLogger::new(Arc::new(fanout)), Some(sqlite)))
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter_str = config.filter_directives();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(config.ansi)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    let (logger, records) = build_logger(&config)?;
    Ok(TelemetryGuard { logger, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.ansi);
        assert!(config.records_db_path.is_none());
    }

    #[test]
    fn filter_directives_include_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("bridge_server".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn,bridge_server=debug");
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn build_logger_without_db() {
        let (logger, records) = build_logger(&TelemetryConfig::default()).unwrap();
        assert!(records.is_none());
        logger.info("session.accept", None, json!({}));
    }

    #[test]
    fn build_logger_with_db_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = TelemetryConfig {
            records_db_path: Some(dir.path().join("records.db")),
            ..Default::default()
        };
        let (logger, records) = build_logger(&config).unwrap();
        let records = records.unwrap();
        logger.error("session.fatal", None, json!("boom"));
        assert_eq!(records.count().unwrap(), 1);
    }
}
