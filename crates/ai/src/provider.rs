//! Chat back-end seam for the reasoning stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use alicia_core::config::{env_opt, env_or, env_u32};

/// A chat message for the back end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A completed chat turn with token accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} — {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

/// Trait for chat back ends — each model API implements this.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn model(&self) -> &str;

    /// Run one chat completion and return the assistant's answer.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<Completion, BackendError>;
}

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            model: env_or("AI_MODEL", "grok-4-0709"),
            base_url: env_or("AI_BASE_URL", "https://api.x.ai/v1"),
            api_key: env_opt("AI_API_KEY").or_else(|| env_opt("XAI_API_KEY")),
            temperature: env_or("AI_TEMPERATURE", "0.7").parse().unwrap_or(0.7),
            max_tokens: env_u32("AI_MAX_TOKENS", 1024),
        }
    }

    /// Large hosted models advertise big windows; everything else gets the
    /// conservative rate profile.
    pub fn rate_limits(&self) -> alicia_voice::RateLimits {
        if self.model.starts_with("grok-4") {
            alicia_voice::RateLimits::hosted()
        } else {
            alicia_voice::RateLimits::conservative()
        }
    }
}

// ── OpenAI-compatible backend ────────────────────────────────────────

/// Chat-completions REST backend (OpenAI-compatible, used by the reference
/// hosted model).
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiBackend {
    pub fn from_config(config: &AiConfig) -> Result<Self, BackendError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| BackendError::NotConfigured("AI_API_KEY not set".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<Completion, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        debug!(model = %self.model, "chat completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }

        let parsed: serde_json::Value = response.json().await?;
        let text = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BackendError::Parse("missing choices[0].message.content".into()))?
            .to_string();
        let tokens_used = parsed["usage"]["total_tokens"].as_u64().unwrap_or(0);

        Ok(Completion {
            text,
            tokens_used,
            model: self.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_profile_follows_model() {
        let mut config = AiConfig {
            model: "grok-4-0709".into(),
            base_url: "https://api.x.ai/v1".into(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 1024,
        };
        assert_eq!(config.rate_limits().requests_per_minute, 480);

        config.model = "llama3.2".into();
        assert_eq!(config.rate_limits().requests_per_minute, 30);
    }

    #[test]
    fn backend_requires_api_key() {
        let config = AiConfig {
            model: "grok-4-0709".into(),
            base_url: "https://api.x.ai/v1".into(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 1024,
        };
        assert!(matches!(
            OpenAiBackend::from_config(&config),
            Err(BackendError::NotConfigured(_))
        ));
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_value(Role::System).unwrap(), "system");
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), "assistant");
    }
}
