//! # bridge
//!
//! Streaming session bridge binary: loads settings, installs telemetry,
//! builds the conversation pipeline and serves `/ws` until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bridge_core::pipeline::Pipeline;
use bridge_graph::{ConversationGraph, EchoModel, GraphConfig, OpenAiChatModel, OpenAiConfig};
use bridge_server::ServerConfig;
use bridge_settings::{BridgeSettings, ModelProvider};
use bridge_telemetry::{LogFormat, TelemetryConfig};
use clap::Parser;
use secrecy::SecretString;

/// Streaming session bridge server.
#[derive(Parser, Debug)]
#[command(name = "bridge", about = "WebSocket bridge for a streaming chat pipeline")]
struct Cli {
    /// Settings file (defaults to ~/.bridge/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    log_level: Option<String>,

    /// `json` or `pretty`.
    #[arg(long)]
    log_format: Option<String>,

    /// Disable ANSI colours in pretty output.
    #[arg(long)]
    no_color: bool,

    /// `echo` or `openai`.
    #[arg(long)]
    model_provider: Option<String>,
}

impl Cli {
    /// Flags win over file and environment.
    fn apply(&self, settings: &mut BridgeSettings) -> Result<()> {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            settings.logging.format.clone_from(format);
        }
        if self.no_color {
            settings.logging.ansi = false;
        }
        if let Some(provider) = &self.model_provider {
            settings.pipeline.model.provider = ModelProvider::parse(provider)
                .with_context(|| format!("unknown model provider: {provider}"))?;
        }
        settings.validate()?;
        Ok(())
    }
}

fn telemetry_config(settings: &BridgeSettings) -> Result<TelemetryConfig> {
    let log_level = tracing::Level::from_str(&settings.logging.level)
        .map_err(|e| anyhow::anyhow!("invalid log level {:?}: {e}", settings.logging.level))?;
    let format = LogFormat::from_str(&settings.logging.format).map_err(anyhow::Error::msg)?;
    Ok(TelemetryConfig {
        log_level,
        format,
        ansi: settings.logging.ansi,
        records_db_path: settings.logging.records_db.as_ref().map(PathBuf::from),
        ..TelemetryConfig::default()
    })
}

fn build_pipeline(settings: &BridgeSettings) -> Result<Arc<dyn Pipeline>> {
    let pipeline = &settings.pipeline;
    let graph_config = GraphConfig {
        keywords: pipeline.keywords.clone(),
        custom_event: pipeline.custom_event.clone(),
    };

    match pipeline.model.provider {
        ModelProvider::Echo => Ok(Arc::new(ConversationGraph::new(EchoModel::new(), graph_config))),
        ModelProvider::Openai => {
            let env = &pipeline.model.api_key_env;
            let Ok(key) = std::env::var(env) else {
                bail!("{env} is not set; the openai provider needs an API key");
            };
            let config = OpenAiConfig {
                model: pipeline.model.model.clone(),
                temperature: pipeline.model.temperature,
                base_url: pipeline.model.base_url.clone(),
                max_retries: pipeline.model.max_retries,
                ..OpenAiConfig::default()
            };
            let model = OpenAiChatModel::new(SecretString::from(key), config)
                .context("failed to build chat model client")?;
            Ok(Arc::new(ConversationGraph::new(model, graph_config)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => bridge_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => bridge_settings::load_settings().context("failed to load settings")?,
    };
    cli.apply(&mut settings)?;

    let telemetry = bridge_telemetry::init_telemetry(telemetry_config(&settings)?)
        .context("failed to initialise telemetry")?;

    let pipeline = build_pipeline(&settings)?;
    tracing::info!(
        pipeline = pipeline.name(),
        provider = ?settings.pipeline.model.provider,
        "pipeline ready"
    );

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_message_size: settings.server.max_message_size,
        shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
    };
    let handle = bridge_server::start(config, pipeline, telemetry.logger())
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.addr(), "bridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!(sessions = handle.active_sessions(), "shutting down");
    if !handle.shutdown().await {
        tracing::warn!("shutdown timed out");
    }
    Ok(())
}
