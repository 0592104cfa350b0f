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

const BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
}

impl OpenAiProvider {
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
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn translate_role(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    fn build_messages(
        system_prompt: Option<&str>,
        messages: &[ProviderMessage],
    ) -> Vec<OpenAiMessage> {
        let mut result = Vec::with_capacity(messages.len() + 1);

        if let Some(prompt) = system_prompt {
            if !prompt.is_empty() {
                result.push(OpenAiMessage {
                    role: "system".to_string(),
                    content: OpenAiContent::Text(prompt.to_string()),
                });
            }
        }

        for msg in messages {
            let content = match msg.parts.as_slice() {
                [MessagePart::Text { text }] => OpenAiContent::Text(text.clone()),
                parts => OpenAiContent::Parts(
                    parts
                        .iter()
                        .map(|part| match part {
                            MessagePart::Text { text } => {
                                OpenAiContentPart::Text { text: text.clone() }
                            }
                            MessagePart::InlineImage { mime_type, data } => {
                                OpenAiContentPart::ImageUrl {
                                    image_url: OpenAiImageUrl {
                                        url: format!("data:{};base64,{}", mime_type, data),
                                    },
                                }
                            }
                        })
                        .collect(),
                ),
            };
            result.push(OpenAiMessage {
                role: Self::translate_role(msg.role).to_string(),
                content,
            });
        }

        result
    }

    fn build_request(request: &ChatRequest, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: Self::build_messages(request.system_prompt.as_deref(), &request.messages),
            stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }

    async fn post(
        &self,
        api_key: &str,
        body: &OpenAiRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
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

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let body = Self::build_request(&request, false);
        let response = self.post(&request.api_key, &body).await?;

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

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
