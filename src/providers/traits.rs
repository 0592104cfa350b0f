use async_trait::async_trait;
use tokio::sync::mpsc;

use super::router::ProviderFamily;
use super::types::{ChatRequest, ProviderError, StreamEvent};

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Non-streaming completion. Used for short secondary calls such as
    /// title generation.
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError>;

    /// Streaming completion. Tokens flow through `tx`; the stream ends with
    /// a `Done` or `Error` event.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}
