//! LLM collaborator contract and the HTTP-backed client
//!
//! [`ChatModel`] is the seam the core components call through; the usage
//! sink is a required parameter of every call so token accounting can never
//! leak between interleaved workspace requests. [`ClaudeClient`] implements
//! the contract against the Anthropic Messages API with retry on transient
//! failures.

use crate::{NimbusError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const MAX_RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One message in a chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Receives token counts for each completed LLM exchange.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, model: &str, input_tokens: u64, output_tokens: u64);
}

/// Sink that discards usage, for call sites with nothing to account.
pub struct NullUsage;

#[async_trait]
impl UsageSink for NullUsage {
    async fn record(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) {}
}

/// Chat completion contract consumed by the compactor and digest paths.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatTurn],
        max_tokens: Option<u32>,
        usage: &dyn UsageSink,
    ) -> Result<String>;
}

// ─── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatTurn],
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ─── Client ─────────────────────────────────────────────────────────

/// Messages API client with retry on transient failures.
#[derive(Clone)]
pub struct ClaudeClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeClient {
    pub fn new(api_key: &str, model: &str, max_tokens: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("nimbus/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Derive a client for a different model. The underlying connection pool
    /// is shared; nothing on `self` changes, so per-workspace overrides
    /// cannot affect unrelated in-flight requests.
    pub fn with_model(&self, model: &str) -> Self {
        let mut derived = self.clone();
        derived.model = model.to_string();
        derived
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Exponential backoff with a small deterministic jitter.
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    }

    fn is_retryable_error(msg: &str) -> bool {
        msg.contains("timeout")
            || msg.contains("network")
            || msg.contains("retryable")
            || msg.contains("connection")
            || msg.contains("error sending request")
    }

    fn map_reqwest_error(e: reqwest::Error) -> NimbusError {
        if e.is_timeout() {
            NimbusError::Llm(format!("timeout: {e}"))
        } else if e.is_connect() {
            NimbusError::Llm(format!("network: {e}"))
        } else {
            NimbusError::Llm(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = truncate_detail(&extract_error_detail(&body), 500);
        let retryable = if Self::is_retryable_status(status) {
            "retryable "
        } else {
            ""
        };
        if detail.is_empty() {
            Err(NimbusError::Llm(format!("{retryable}API error {status}")))
        } else {
            Err(NimbusError::Llm(format!(
                "{retryable}API error {status}: {detail}"
            )))
        }
    }

    async fn send(&self, system: &str, messages: &[ChatTurn], max_tokens: u32) -> Result<MessagesResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            system,
            messages,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let response = Self::check_status(response).await?;
        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| NimbusError::Llm(e.to_string()))
    }
}

#[async_trait]
impl ChatModel for ClaudeClient {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatTurn],
        max_tokens: Option<u32>,
        usage: &dyn UsageSink,
    ) -> Result<String> {
        let max_tokens = max_tokens.unwrap_or(self.max_tokens);
        debug!(
            "chat request: model={}, {} message(s)",
            self.model,
            messages.len()
        );

        let mut last_err = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                let delay = Self::retry_backoff(attempt);
                warn!(
                    "LLM request failed (attempt {}/{}), retrying in {:?}...",
                    attempt, MAX_RETRY_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.send(system, messages, max_tokens).await {
                Ok(response) => {
                    usage
                        .record(
                            &self.model,
                            response.usage.input_tokens,
                            response.usage.output_tokens,
                        )
                        .await;
                    let text = response
                        .content
                        .iter()
                        .find(|block| block.kind == "text")
                        .map(|block| block.text.clone())
                        .unwrap_or_default();
                    return Ok(text);
                }
                Err(e) => {
                    let msg = e.to_string();
                    if Self::is_retryable_error(&msg) && attempt + 1 < MAX_RETRY_ATTEMPTS {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| NimbusError::Llm("all retry attempts exhausted".to_string())))
    }
}

fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    trimmed.to_string()
}

fn truncate_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }
    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}
