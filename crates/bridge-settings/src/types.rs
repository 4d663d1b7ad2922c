//! Settings tree. Every section has compiled defaults so a partial file is valid.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.bridge/settings.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub pipeline: PipelineSettings,
}

impl BridgeSettings {
    /// Reject values that deserialize fine but cannot be served.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host is empty".into()));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be non-zero".into(),
            ));
        }
        if self.pipeline.custom_event.is_empty() {
            return Err(SettingsError::InvalidValue(
                "pipeline.customEvent is empty".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.pipeline.model.temperature) {
            return Err(SettingsError::InvalidValue(format!(
                "pipeline.model.temperature {} outside 0..=2",
                self.pipeline.model.temperature
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. 0 asks the OS for a free one.
    pub port: u16,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Grace period for in-flight sessions on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_message_size: 1024 * 1024,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub ansi: bool,
    /// SQLite file for structured records. Unset keeps records in the log stream only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_db: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            ansi: false,
            records_db: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// Deterministic local model, no network.
    #[default]
    Echo,
    /// OpenAI-compatible `/chat/completions` endpoint.
    Openai,
}

impl ModelProvider {
    /// Parse a provider name, case-insensitively.
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "echo" => Some(Self::Echo),
            "openai" => Some(Self::Openai),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub provider: ModelProvider,
    pub model: String,
    pub temperature: f32,
    pub base_url: String,
    pub max_retries: u32,
    /// Environment variable holding the API key. The key itself never lives in the file.
    pub api_key_env: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Echo,
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            base_url: "https://api.openai.com/v1".to_string(),
            max_retries: 2,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub model: ModelSettings,
    /// Substrings that trigger the custom event when found in the latest message.
    pub keywords: Vec<String>,
    /// Name of the custom event dispatched on a keyword hit.
    pub custom_event: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
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
