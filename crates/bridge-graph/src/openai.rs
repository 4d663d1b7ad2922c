//! OpenAI-compatible streaming chat client (`POST {base_url}/chat/completions`).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::errors::PipelineError;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::checkpoint::ChatMessage;
use crate::model::{ChatModel, FragmentStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub model: String,
    pub temperature: f32,
    pub base_url: String,
    /// Attempts after the first one. Only failures before any byte arrives are retried.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            base_url: "https://api.openai.com/v1".to_string(),
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl OpenAiConfig {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

pub struct OpenAiChatModel {
    client: Client,
    api_key: SecretString,
    config: OpenAiConfig,
}

impl OpenAiChatModel {
    /// Build the HTTP client. Fails only if the client itself cannot be constructed.
    pub fn new(api_key: SecretString, config: OpenAiConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Model(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "stream": true,
            "messages": messages,
        })
    }

    async fn send_once(&self, body: &Value) -> Result<reqwest::Response, PipelineError> {
        let resp = self
            .client
            .post(self.endpoint())
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Http { status, body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, messages), fields(model = %self.config.model))]
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream, PipelineError> {
        let body = self.request_body(messages);
        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(resp) => return Ok(Box::pin(SseFragments::new(resp.bytes_stream()))),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying chat completion"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// What one SSE `data:` payload contributes to the fragment stream.
#[derive(Debug, PartialEq)]
enum SseData {
    Fragment(String),
    Done,
    Skip,
    Error(String),
}

fn parse_data_line(line: &str) -> SseData {
    let line = line.trim();
    let Some(data) = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
    else {
        return SseData::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseData::Done;
    }
    if data.is_empty() {
        return SseData::Skip;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => {
            if let Some(err) = value.get("error") {
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                return SseData::Error(message);
            }
            match value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
            {
                Some(content) => SseData::Fragment(content.to_string()),
                None => SseData::Skip,
            }
        }
        Err(e) => {
            warn!(error = %e, "unparseable SSE payload, skipping");
            SseData::Skip
        }
    }
}

/// Turns an SSE byte stream into content fragments.
/// Emits a stream error if no bytes arrive within the idle timeout.
struct SseFragments {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: BytesMut,
    pending: VecDeque<Result<String, PipelineError>>,
    done: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl SseFragments {
    fn new(byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            done: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    fn consume_line(&mut self, line: &str) {
        if self.done {
            return;
        }
        match parse_data_line(line) {
            SseData::Fragment(f) => self.pending.push_back(Ok(f)),
            SseData::Done => self.done = true,
            SseData::Skip => {}
            SseData::Error(message) => {
                self.pending.push_back(Err(PipelineError::Model(message)));
                self.done = true;
            }
        }
    }

    /// Lines are split on raw bytes so a multibyte character cut across
    /// chunks is only decoded once it is whole.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.consume_bytes(&line);
        }
    }

    fn consume_bytes(&mut self, line: &[u8]) {
        match std::str::from_utf8(line) {
            Ok(line) => self.consume_line(line),
            Err(e) => warn!(error = %e, "non-UTF-8 SSE line, skipping"),
        }
    }
}

impl Stream for SseFragments {
    type Item = Result<String, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(PipelineError::Stream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    let rest = self.buffer.split();
                    self.consume_bytes(&rest);
                    self.done = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(Err(PipelineError::Timeout(self.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use futures::StreamExt;

    fn chunk(s: &str) -> Result<Bytes, reqwest::Error> {
        Ok(Bytes::from(s.to_string()))
    }

    fn delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn parse_data_lines() {
        assert_eq!(parse_data_line(&delta("Hi")), SseData::Fragment("Hi".into()));
        assert_eq!(parse_data_line("data: [DONE]"), SseData::Done);
        assert_eq!(parse_data_line(": keep-alive"), SseData::Skip);
        assert_eq!(parse_data_line(""), SseData::Skip);
        assert_eq!(
            parse_data_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseData::Skip
        );
        assert_eq!(
            parse_data_line(r#"data: {"error":{"message":"quota"}}"#),
            SseData::Error("quota".into())
        );
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let config = OpenAiConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(500));
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(2000));
        assert_eq!(config.retry_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn request_body_shape() {
        let model =
            OpenAiChatModel::new(SecretString::from("sk-test"), OpenAiConfig::default()).unwrap();
        let body = model.request_body(&[ChatMessage::user("hi")]);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(model.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[tokio::test]
    async fn fragments_across_split_chunks() {
        let body = format!("{}{}data: [DONE]\n\n", delta("Hi"), delta(" there"));
        let (a, b) = body.split_at(17);
        let stream = futures::stream::iter(vec![chunk(a), chunk(b)]);
        let fragments: Vec<_> = SseFragments::new(stream).collect().await;
        let fragments: Vec<String> = fragments.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(fragments, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let body = format!("{}data: [DONE]\n\n", delta("héllo"));
        let bytes = body.into_bytes();
        let cut = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let stream = futures::stream::iter(vec![
            Ok::<_, reqwest::Error>(Bytes::copy_from_slice(&bytes[..cut])),
            Ok(Bytes::copy_from_slice(&bytes[cut..])),
        ]);
        let fragments: Vec<_> = SseFragments::new(stream).collect().await;
        let fragments: Vec<String> = fragments.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(fragments, vec!["héllo"]);
    }

    #[tokio::test]
    async fn content_after_done_is_ignored() {
        let body = format!("{}data: [DONE]\n\n{}", delta("a"), delta("b"));
        let stream = futures::stream::iter(vec![chunk(&body)]);
        let fragments: Vec<_> = SseFragments::new(stream).collect().await;
        assert_eq!(fragments.len(), 1);
    }

    #[tokio::test]
    async fn error_payload_ends_stream() {
        let body = format!("{}data: {{\"error\":{{\"message\":\"boom\"}}}}\n\n", delta("a"));
        let stream = futures::stream::iter(vec![chunk(&body)]);
        let items: Vec<_> = SseFragments::new(stream).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(PipelineError::Model(m)) if m == "boom"));
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_consumed() {
        let body = delta("x").trim_end().to_string();
        let stream = futures::stream::iter(vec![chunk(&body)]);
        let fragments: Vec<_> = SseFragments::new(stream).collect().await;
        assert_eq!(fragments.len(), 1);
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();
        let pending = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseFragments::with_idle_timeout(
            pending,
            Duration::from_secs(5),
        ));
        let item = stream.next().await;
        assert!(matches!(item, Some(Err(PipelineError::Timeout(_)))));
        assert!(stream.next().await.is_none());
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn fast_config(base_url: String, max_retries: u32) -> OpenAiConfig {
        OpenAiConfig {
            base_url,
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn retries_server_errors_before_streaming() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        return (StatusCode::SERVICE_UNAVAILABLE, "busy".to_string())
                            .into_response();
                    }
                    let body = format!("{}{}data: [DONE]\n\n", delta("Hello"), delta("!"));
                    (StatusCode::OK, body).into_response()
                }
            }),
        );
        let base_url = serve(app).await;

        let model =
            OpenAiChatModel::new(SecretString::from("sk-test"), fast_config(base_url, 2)).unwrap();
        let stream = model.stream_chat(&[ChatMessage::user("hi")]).await.unwrap();
        let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(fragments.concat(), "Hello!");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::UNAUTHORIZED, "bad key") }
            }),
        );
        let base_url = serve(app).await;

        let model =
            OpenAiChatModel::new(SecretString::from("sk-bad"), fast_config(base_url, 2)).unwrap();
        let result = model.stream_chat(&[ChatMessage::user("hi")]).await;
        assert!(matches!(result, Err(PipelineError::Http { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }
            }),
        );
        let base_url = serve(app).await;

        let model =
            OpenAiChatModel::new(SecretString::from("sk-test"), fast_config(base_url, 2)).unwrap();
        let result = model.stream_chat(&[ChatMessage::user("hi")]).await;
        assert!(matches!(result, Err(PipelineError::Http { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
