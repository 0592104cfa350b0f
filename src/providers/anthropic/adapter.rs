use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use crate::models::Role;
use crate::providers::router::ProviderFamily;
use crate::providers::traits::AiProvider;
use crate::providers::types::{
    ChatRequest, MessagePart, ProviderError, ProviderMessage, StreamEvent,
};

const BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn translate_role(role: Role) -> &'static str {
        match role {
            Role::User | Role::System => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_messages(messages: &[ProviderMessage]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .map(|msg| {
                let content = match msg.parts.as_slice() {
                    [MessagePart::Text { text }] => AnthropicContent::Text(text.clone()),
                    parts => AnthropicContent::Blocks(
                        parts
                            .iter()
                            .map(|part| match part {
                                MessagePart::Text { text } => {
                                    AnthropicContentBlock::Text { text: text.clone() }
                                }
                                MessagePart::InlineImage { mime_type, data } => {
                                    AnthropicContentBlock::Image {
                                        source: AnthropicImageSource {
                                            source_type: "base64".to_string(),
                                            media_type: mime_type.clone(),
                                            data: data.clone(),
                                        },
                                    }
                                }
                            })
                            .collect(),
                    ),
                };
                AnthropicMessage {
                    role: Self::translate_role(msg.role).to_string(),
                    content,
                }
            })
            .collect()
    }

    fn build_request(request: &ChatRequest, stream: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: Self::build_messages(&request.messages),
            system: request.system_prompt.clone(),
            temperature: request.temperature,
            stream: stream.then_some(true),
        }
    }

    async fn post(
        &self,
        api_key: &str,
        body: &AnthropicRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }
        Ok(response)
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let body = Self::build_request(&request, false);
        let response = self.post(&request.api_key, &body).await?;

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }
        Ok(content)
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = Self::build_request(&request, true);
        let response = self.post(&request.api_key, &body).await?;
        super::stream::parse_sse_stream(response, tx).await;
        Ok(())
    }
}
