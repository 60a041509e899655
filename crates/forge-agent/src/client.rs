//! LLM message API client
//!
//! `AnthropicClient` sends one request per call; conversation state is owned
//! by the caller. Rate limits (429) and server errors (5xx) are retried with
//! exponential backoff, honouring `retry-after` when present.

use crate::auth;
use crate::types::{MessageRequest, MessageResponse};
use async_trait::async_trait;
use forge_core::{ForgeError, LlmConfig, Result};
use std::time::Duration;

// Retry configuration
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 120;

/// A message API the tool-use loop can drive
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one request and return the model's response
    async fn send(&self, request: &MessageRequest) -> Result<MessageResponse>;

    /// Whether credentials are available
    fn is_configured(&self) -> bool;
}

/// Anthropic Messages API client
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    anthropic_version: String,
    max_retries: u32,
}

impl AnthropicClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_config(&LlmConfig::default(), api_key)
    }

    /// Build a client from config, reading the key from the configured env var
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = match auth::api_key_from_env(&config.api_key_env) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        };
        Self::with_config(config, api_key)
    }

    fn with_config(config: &LlmConfig, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key,
            anthropic_version: config.anthropic_version.clone(),
            max_retries: config.max_retries,
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn send(&self, request: &MessageRequest) -> Result<MessageResponse> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ForgeError::Auth("LLM client has no API key configured".to_string())
        })?;

        // Retry loop with exponential backoff for rate limits
        let mut retries = 0;
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            tracing::debug!(
                "Sending request to {} (model {}, {} messages, attempt {})",
                self.api_url,
                request.model,
                request.messages.len(),
                retries + 1
            );

            let response = self
                .http
                .post(&self.api_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", &self.anthropic_version)
                .header("content-type", "application/json")
                .json(request)
                .send()
                .await
                .map_err(|e| ForgeError::Api(format!("Failed to send request: {}", e)))?;

            let status = response.status();

            // Handle rate limit (429) with retry
            if status.as_u16() == 429 {
                retries += 1;

                if retries > self.max_retries {
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown".to_string());
                    return Err(ForgeError::ApiLimit(format!(
                        "Rate limit exceeded after {} retries. Last error: {}",
                        self.max_retries, error_text
                    )));
                }

                let wait_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                tracing::warn!(
                    "Rate limited (429). Waiting {} seconds before retry {}/{}",
                    wait_secs,
                    retries,
                    self.max_retries
                );

                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());

                if status.is_server_error() && retries < self.max_retries {
                    retries += 1;
                    tracing::warn!(
                        "Server error ({}). Waiting {} seconds before retry {}/{}",
                        status,
                        backoff_secs,
                        retries,
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                return Err(ForgeError::Api(format!(
                    "Anthropic API error {}: {}",
                    status, error_text
                )));
            }

            let parsed: MessageResponse = response
                .json()
                .await
                .map_err(|e| ForgeError::Api(format!("Failed to parse response: {}", e)))?;

            tracing::debug!(
                "Response {} ({:?}, {} input tokens, {} output tokens)",
                parsed.id,
                parsed.stop_reason,
                parsed.usage.input_tokens,
                parsed.usage.output_tokens
            );

            return Ok(parsed);
        }
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}
