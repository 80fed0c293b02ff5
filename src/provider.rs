//! Model provider collaborator: chat completions and embeddings.
//!
//! The pipeline never retries provider calls itself. Transient failures
//! (timeouts, 429, 5xx) are retried here, inside the provider, with
//! exponential backoff.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub json: bool,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionOptions {
    pub fn json(max_tokens: u32, temperature: f32) -> Self {
        CompletionOptions {
            json: true,
            max_tokens,
            temperature,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider returned no content")]
    Empty,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Empty | ProviderError::Unavailable(_) => false,
        }
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub embedding_model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub requests_per_minute: u32,
}

/// OpenAI-compatible HTTP provider (`/chat/completions`, `/embeddings`).
pub struct OpenAiProvider {
    client: reqwest::Client,
    settings: OpenAiSettings,
    rate_limiter: DefaultDirectRateLimiter,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiProvider {
    pub fn new(settings: OpenAiSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("coursegen-runtime/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()?;
        let quota = Quota::per_minute(
            NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        );
        Ok(OpenAiProvider {
            client,
            rate_limiter: RateLimiter::direct(quota),
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let mut attempt = 0u32;
        loop {
            self.rate_limiter.until_ready().await;
            let result = self.send_once(path, body).await;
            match result {
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let backoff = retry_backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        ?backoff,
                        "transient provider error; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.settings.api_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: options.json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let response: ChatResponse = self.post_json("chat/completions", &request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ProviderError::Empty)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = EmbeddingRequest {
            model: &self.settings.embedding_model,
            input: text,
        };
        let response: EmbeddingResponse = self.post_json("embeddings", &request).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|e| !e.is_empty())
            .ok_or(ProviderError::Empty)
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 500ms doubling per attempt, capped at `MAX_BACKOFF`.
fn retry_backoff(attempt: u32) -> Duration {
    let millis = 2u64
        .checked_pow(attempt)
        .and_then(|factor| factor.checked_mul(500))
        .unwrap_or(u64::MAX);
    Duration::from_millis(millis).min(MAX_BACKOFF)
}
