//! # Model Transport
//!
//! The seam between the invoker and a model endpoint. A transport sends one
//! prompt with the requested output schema and returns the raw JSON payload;
//! it does not validate the payload against the schema.
//!
//! [`OllamaTransport`] talks to an Ollama-compatible `/api/chat` endpoint with
//! structured output (`format` set to the JSON schema).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::schema::describe;
use crate::error::TransportError;
use crate::models::ModelConfig;

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// An ordered list of chat messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        });
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        });
        self
    }

    /// Concatenated message contents, as the tokenizer sees them
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Black-box model invocation
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn invoke(
        &self,
        model: &ModelConfig,
        format: &Value,
        prompt: &Prompt,
    ) -> Result<Value, TransportError>;
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// Transport for Ollama-compatible chat endpoints
#[derive(Debug, Clone)]
pub struct OllamaTransport {
    client: reqwest::Client,
    temperature: f32,
}

impl OllamaTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl ModelTransport for OllamaTransport {
    async fn invoke(
        &self,
        model: &ModelConfig,
        format: &Value,
        prompt: &Prompt,
    ) -> Result<Value, TransportError> {
        let url = format!("{}/api/chat", model.base_url());
        let body = json!({
            "model": model.model,
            "messages": prompt.messages,
            "format": format,
            "stream": false,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        parse_content(&chat.message.content)
    }
}

/// Parse the JSON object a model wrote, tolerating a markdown code fence
pub fn parse_content(content: &str) -> Result<Value, TransportError> {
    let trimmed = strip_fence(content.trim());
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| TransportError::Malformed(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(TransportError::Malformed(format!(
            "expected a JSON object, got {}",
            describe(&value)
        )))
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
