//! Generation backends and the retrying client in front of them.
//!
//! [`Generator`] is the backend seam. Implementations:
//! - **[`DisabledGenerator`]**: rejects every call; used when no provider is configured.
//! - **[`OllamaGenerator`]**: `POST /api/generate`, non-streaming.
//! - **[`OpenAIGenerator`]**: `POST /v1/chat/completions`.
//!
//! Backends make exactly one request per call. [`GenerationClient`] owns
//! the retry policy: every attempt runs under a deadline, failed attempts
//! back off exponentially, and after `max_retries + 1` attempts the last
//! cause is returned inside [`GenerationError::Exhausted`].
//!
//! # Retry Strategy
//!
//! - Timeout, network error, HTTP 429, HTTP 5xx, empty response → retry
//! - HTTP 4xx (not 429), disabled provider → [`Rejected`], fail immediately
//! - Backoff: `retry_backoff_ms` × 1, 2, 4, … (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use groundwork_core::{Answer, GenerationError, Prompt};

use crate::cache::{cache_key, AnswerCache};
use crate::config::GenerationConfig;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// A generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    /// Complete `prompt` with a single backend call.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Marks a backend failure that retrying cannot fix.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Rejected(pub String);

fn is_rejected(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Rejected>().is_some()
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(Rejected("generation is disabled; set [generation] provider in config".to_string()).into())
    }
}

// ============ HTTP ============

/// POST once; classify failures as retryable or [`Rejected`].
async fn post_json(label: &str, request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
    let response = request
        .send()
        .await
        .map_err(|e| anyhow!("{} connection error: {}", label, e))?;
    let status = response.status();

    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body_text = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 || status.is_server_error() {
        bail!("{} API error {}: {}", label, status, body_text);
    }
    Err(Rejected(format!("{} API error {}: {}", label, status, body_text)).into())
}

// ============ Ollama ============

/// Generator backed by a local Ollama instance.
pub struct OllamaGenerator {
    model: String,
    url: String,
    options: serde_json::Value,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            options: serde_json::json!({
                "temperature": config.temperature,
                "num_ctx": config.max_tokens,
                "top_k": 40,
                "top_p": 0.9,
                "repeat_penalty": 1.1,
            }),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": self.options,
        });
        let endpoint = format!("{}/api/generate", self.url);
        let json = post_json("Ollama", self.client.post(&endpoint).json(&body)).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<String> {
    json.get("response")
        .and_then(|r| r.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing response field"))
}

// ============ OpenAI ============

/// Generator backed by the OpenAI chat completions API. Reads `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    model: String,
    endpoint: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());

        Ok(Self {
            model,
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json("OpenAI", request).await?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

/// Build the generator named in `config`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(
            OllamaGenerator::new(config).context("Failed to configure Ollama generator")?,
        )),
        "openai" => Ok(Arc::new(
            OpenAIGenerator::new(config).context("Failed to configure OpenAI generator")?,
        )),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Client ============

/// Retrying, caching front end for a [`Generator`].
#[derive(Clone)]
pub struct GenerationClient {
    generator: Arc<dyn Generator>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    cache: Option<Arc<dyn AnswerCache>>,
}

impl GenerationClient {
    pub fn new(generator: Arc<dyn Generator>, config: &GenerationConfig) -> Self {
        Self {
            generator,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn AnswerCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    /// Total attempts made before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub async fn generate(&self, prompt: &Prompt) -> Result<Answer, GenerationError> {
        self.generate_with_timeout(prompt, self.timeout).await
    }

    /// Generate with a per-attempt deadline of `timeout`.
    ///
    /// An attempt that misses the deadline is abandoned and counts against
    /// the retry budget.
    pub async fn generate_with_timeout(
        &self,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<Answer, GenerationError> {
        let model = self.model_name().to_string();
        let key = cache_key(&model, &prompt.text);

        if let Some(text) = self.cache_get(&key).await {
            debug!(model = %model, "answer served from cache");
            return Ok(Answer {
                text,
                model,
                attempts: 0,
                cached: true,
            });
        }

        let attempts = self.max_attempts();
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(model = %model, attempt, delay_ms = delay.as_millis() as u64, "retrying generation");
                tokio::time::sleep(delay).await;
            }

            let call = self.generator.generate(&prompt.text);
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    info!(model = %model, attempt, chars = text.len(), "generation complete");
                    self.cache_put(&key, &text).await;
                    return Ok(Answer {
                        text,
                        model,
                        attempts: attempt,
                        cached: false,
                    });
                }
                Ok(Ok(_)) => {
                    warn!(model = %model, attempt, "generation returned empty text");
                    last_err = Some(anyhow!("{} returned an empty response", model));
                }
                Ok(Err(e)) if is_rejected(&e) => {
                    warn!(model = %model, error = %e, "generation rejected");
                    return Err(GenerationError::Rejected {
                        model,
                        cause: e.into(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(model = %model, attempt, error = %e, "generation attempt failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    warn!(model = %model, attempt, timeout_ms = timeout.as_millis() as u64, "generation attempt timed out");
                    last_err = Some(anyhow!("generation timed out after {:?}", timeout));
                }
            }
        }

        let cause = last_err.unwrap_or_else(|| anyhow!("no generation attempts made"));
        Err(GenerationError::Exhausted {
            model,
            attempts,
            cause: cause.into(),
        })
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        self.retry_backoff * (1u32 << (retry - 1).min(5))
    }

    async fn cache_get(&self, key: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "answer cache lookup failed");
                None
            }
        }
    }

    async fn cache_put(&self, key: &str, text: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(key, text).await {
                warn!(error = %e, "answer cache store failed");
            }
        }
    }
}
