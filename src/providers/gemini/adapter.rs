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

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: Client,
    base_url: String,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Parse an API error response body into a user-friendly message.
    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(msg) = parsed["error"]["message"].as_str() {
                return format!("HTTP {}: {}", status.as_u16(), msg);
            }
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn translate_role(role: Role) -> &'static str {
        match role {
            Role::User | Role::System => "user",
            Role::Assistant => "model",
        }
    }

    fn build_contents(messages: &[ProviderMessage]) -> Vec<GeminiContent> {
        messages
            .iter()
            .map(|msg| {
                let parts = msg
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text { text } => GeminiPart {
                            text: Some(text.clone()),
                            inline_data: None,
                        },
                        MessagePart::InlineImage { mime_type, data } => GeminiPart {
                            text: None,
                            inline_data: Some(GeminiInlineData {
                                mime_type: mime_type.clone(),
                                data: data.clone(),
                            }),
                        },
                    })
                    .collect();

                GeminiContent {
                    role: Self::translate_role(msg.role).to_string(),
                    parts,
                }
            })
            .collect()
    }

    fn build_request(request: &ChatRequest) -> GeminiRequest {
        let generation_config = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            })
        } else {
            None
        };

        let system_instruction = request.system_prompt.as_ref().map(|prompt| GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: Some(prompt.clone()),
                inline_data: None,
            }],
        });

        GeminiRequest {
            contents: Self::build_contents(&request.messages),
            system_instruction,
            generation_config,
        }
    }

    async fn post(
        &self,
        url: &str,
        api_key: &str,
        body: &GeminiRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: None,
            });
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

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for GeminiProvider {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Google
    }

    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let body = Self::build_request(&request);
        let response = self.post(&url, &request.api_key, &body).await?;

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::RequestFailed(
                error.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().filter_map(|p| p.text).next())
            .ok_or_else(|| ProviderError::InvalidResponse("No content in response".to_string()))
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        let body = Self::build_request(&request);
        let response = self.post(&url, &request.api_key, &body).await?;
        super::stream::parse_sse_stream(response, tx).await;
        Ok(())
    }
}
