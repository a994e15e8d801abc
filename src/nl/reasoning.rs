//! Reasoning service client
//!
//! The NL pipeline talks to a language model through [`ReasoningService`].
//! [`AnthropicReasoning`] speaks the Anthropic Messages API; tests substitute a stub.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{QuarryError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One completion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

impl ReasoningRequest {
    #[must_use]
    pub fn new(system: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self { system: system.into(), messages, max_tokens: DEFAULT_MAX_TOKENS }
    }
}

/// Text completion backend
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Complete the conversation and return the reply text
    async fn complete(&self, request: &ReasoningRequest) -> Result<String>;
}

/// Anthropic Messages API client
pub struct AnthropicReasoning {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicReasoning {
    pub fn new(api_key: impl Into<String>, model: Option<String>, base_url: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QuarryError::reasoning(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ReasoningService for AnthropicReasoning {
    #[instrument(skip(self, request), level = "debug", fields(model = %self.model))]
    async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": request.messages,
        });

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| QuarryError::reasoning(format!("Request to reasoning service failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QuarryError::reasoning(format!("HTTP {status}: {}", error_detail(&text))));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| QuarryError::reasoning(format!("Invalid response body: {e}")))?;
        let text = response_text(&json)?;
        debug!(chars = text.len(), "reasoning reply received");
        Ok(text)
    }
}

/// Concatenate the `text` content blocks of a Messages API response
fn response_text(json: &Value) -> Result<String> {
    let blocks = json
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| QuarryError::reasoning("Response has no content"))?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(QuarryError::reasoning("Response contained no text"));
    }
    Ok(text)
}

/// Error message from an API error body, or the raw body trimmed
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect())
}
