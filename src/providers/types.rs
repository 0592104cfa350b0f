use serde::Serialize;
use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

// --- Provider-neutral message format ---

/// One part of a multi-part message. Text passes through; images carry the
/// base64 payload and MIME type verbatim.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    InlineImage { mime_type: String, data: String },
}

/// A message in the provider-neutral shape produced by the formatter.
/// Only user and assistant roles appear here; the system role travels on
/// the separate system-prompt channel.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl ProviderMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![MessagePart::Text { text: text.into() }],
        }
    }
}

// --- Chat types ---

#[derive(Clone)]
pub struct ChatRequest {
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ProviderMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequest")
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("messages", &self.messages)
            .field("system_prompt", &self.system_prompt)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done {
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
    },
    Error(String),
}
