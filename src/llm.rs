//! Model-call collaborator boundary.
//!
//! The pipeline depends only on [`ModelClient`]: messages in, content plus
//! per-call usage out. Usage is returned as a value with every call and
//! accumulated by the caller, so concurrent calls need no shared counters.
//!
//! The shipped implementation talks to any OpenAI-compatible chat-completions
//! endpoint (OpenAI, DeepSeek, Gemini's OpenAI surface). Transient failures
//! (HTTP 429, 5xx, network errors) are retried once; other client errors fail
//! immediately.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Token counts for one call, returned alongside the content.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    /// Cost in dollars at the configured per-million-token rates.
    pub fn cost(&self, config: &LlmConfig) -> f64 {
        const TOKENS_PER_MILLION: f64 = 1_000_000.0;
        self.prompt_tokens as f64 * (config.cost_per_million_input / TOKENS_PER_MILLION)
            + self.completion_tokens as f64 * (config.cost_per_million_output / TOKENS_PER_MILLION)
    }
}

/// Result of one successful model call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: Usage,
}

/// The black-box model-call contract the executor depends on.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<ChatOutcome>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl ModelClient for OpenAiChatClient {
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<ChatOutcome> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });

        let mut last_err = None;

        // Retry once on transient errors, per the boundary contract
        for attempt in 0..=1 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let resp = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: ChatCompletionResponse = response
                            .json()
                            .await
                            .context("Invalid chat completion response body")?;
                        let choice = parsed
                            .choices
                            .into_iter()
                            .next()
                            .context("Chat completion response has no choices")?;
                        return Ok(ChatOutcome {
                            content: choice.message.content,
                            usage: parsed.usage.unwrap_or_default(),
                        });
                    }

                    // Rate limited or server error — transient, retry once
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Model API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Model API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Model call failed after retry")))
    }
}
