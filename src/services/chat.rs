use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::Message;
use crate::providers::{
    format_messages, AiProvider, ChatRequest, CredentialOverrides, ProviderError, ProviderFamily,
    ProviderRouter, RoutingError, StreamEvent,
};
use crate::services::settings::AppSettings;

/// Upper bound on time-to-first-token. Expiry is a retryable interruption,
/// distinct from an explicit upstream error response.
const FIRST_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// The error taxonomy surfaced at the chat boundary. Detected before any
/// streaming begins, except `StreamInterrupted`. Credential values never
/// appear in these messages.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No credential configured for provider {}", .0.as_str())]
    MissingCredential(ProviderFamily),

    #[error("Provider rejected the credential: {0}")]
    UpstreamAuthFailure(String),

    #[error("Rate limited by provider: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),
}

impl ChatError {
    pub fn status(&self) -> u16 {
        match self {
            ChatError::BadRequest(_) | ChatError::UnknownModel(_) => 400,
            ChatError::MissingCredential(_) | ChatError::UpstreamAuthFailure(_) => 401,
            ChatError::RateLimited { .. } => 429,
            ChatError::StreamInterrupted(_) | ChatError::Upstream(_) => 500,
        }
    }

    /// Whether retrying the identical request from the last committed state
    /// is a reasonable remediation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::RateLimited { .. } | ChatError::StreamInterrupted(_)
        )
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            message: self.to_string(),
            status: self.status(),
        }
    }
}

/// The structured failure payload returned instead of a streaming body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub status: u16,
}

impl From<RoutingError> for ChatError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::UnknownModel(m) => ChatError::UnknownModel(m),
            RoutingError::MissingCredential(f) => ChatError::MissingCredential(f),
            RoutingError::UnregisteredFamily(f) => {
                ChatError::UnknownModel(f.as_str().to_string())
            }
        }
    }
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AuthError(m) => ChatError::UpstreamAuthFailure(m),
            ProviderError::RateLimited { retry_after_secs } => {
                ChatError::RateLimited { retry_after_secs }
            }
            ProviderError::NetworkError(m) => ChatError::StreamInterrupted(m),
            ProviderError::RequestFailed(m) | ProviderError::InvalidResponse(m) => {
                ChatError::Upstream(m)
            }
        }
    }
}

/// One logical chat turn as accepted by the streaming boundary.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub messages: Vec<Message>,
    pub model: String,
    /// Conversation-level prompt; overrides the global one from settings.
    pub system_prompt: Option<String>,
}

/// A validated turn, ready to dispatch to the resolved provider.
pub struct ChatDispatchParams {
    pub request: ChatRequest,
    pub provider: Arc<dyn AiProvider>,
    pub conversation_id: String,
    pub message_id: String,
}

impl fmt::Debug for ChatDispatchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatDispatchParams")
            .field("request", &self.request)
            .field("provider", &self.provider.family().as_str())
            .field("conversation_id", &self.conversation_id)
            .field("message_id", &self.message_id)
            .finish()
    }
}

/// Validate a turn and resolve everything needed to dispatch it. Fails fast,
/// in order: empty history, missing model, missing credential, unroutable
/// prefix. No network traffic happens here.
pub fn prepare_turn(
    router: &ProviderRouter,
    turn: &TurnRequest,
    overrides: &CredentialOverrides,
    settings: &AppSettings,
    conversation_id: String,
    message_id: String,
) -> Result<ChatDispatchParams, ChatError> {
    if turn.messages.is_empty() {
        return Err(ChatError::BadRequest("Messages must not be empty".into()));
    }
    if turn.model.is_empty() {
        return Err(ChatError::BadRequest("Model must be specified".into()));
    }

    let family = ProviderFamily::for_model(&turn.model)?;
    let api_key = ProviderRouter::resolve_credential(family, overrides, &settings.credentials)?;
    let provider = router.resolve_provider(&turn.model)?;

    let system_prompt = turn
        .system_prompt
        .clone()
        .or_else(|| settings.system_prompt.clone())
        .filter(|s| !s.trim().is_empty());

    let temperature = if (settings.temperature - 1.0).abs() < f32::EPSILON {
        None
    } else {
        Some(settings.temperature)
    };

    let request = ChatRequest {
        api_key,
        model: turn.model.clone(),
        messages: format_messages(&turn.messages),
        system_prompt,
        temperature,
        max_tokens: None,
    };

    Ok(ChatDispatchParams {
        request,
        provider,
        conversation_id,
        message_id,
    })
}

/// Result from streaming: a token update, completion, cancellation, or error.
#[derive(Debug)]
pub enum StreamResult {
    Token {
        conversation_id: String,
        message_id: String,
        accumulated: String,
    },
    Done {
        conversation_id: String,
        message_id: String,
        full_content: String,
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
    },
    Cancelled {
        conversation_id: String,
        message_id: String,
    },
    Error {
        conversation_id: String,
        message_id: String,
        error: ChatError,
    },
}

enum Pump {
    Event(StreamEvent),
    Failed(ProviderError),
}

/// Run a streaming request, forwarding `StreamResult` events to `events`.
///
/// Cancellation aborts the upstream request and never reports partial
/// content as complete; whatever was buffered is dropped by the caller.
pub async fn run_streaming(
    params: ChatDispatchParams,
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<StreamResult>,
) {
    let ChatDispatchParams {
        request,
        provider,
        conversation_id,
        message_id,
    } = params;

    let (pump_tx, mut pump_rx) = mpsc::channel::<Pump>(64);
    let stream_task = tokio::spawn({
        let pump_tx = pump_tx.clone();
        async move {
            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let streaming = provider.stream_chat(request, tx);
            tokio::pin!(streaming);
            loop {
                tokio::select! {
                    result = &mut streaming => {
                        if let Err(e) = result {
                            let _ = pump_tx.send(Pump::Failed(e)).await;
                        }
                        // Drain anything still buffered, then stop
                        while let Ok(event) = rx.try_recv() {
                            let _ = pump_tx.send(Pump::Event(event)).await;
                        }
                        return;
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                if pump_tx.send(Pump::Event(event)).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    });
    drop(pump_tx);

    let mut accumulated = String::new();
    let mut first = true;

    loop {
        // The first-token deadline only applies until anything arrives, so
        // the recv is wrapped in a timeout conditionally rather than as a
        // separate select branch.
        let recv = async {
            if first {
                tokio::time::timeout(FIRST_TOKEN_TIMEOUT, pump_rx.recv())
                    .await
                    .map_err(|_| ())
            } else {
                Ok(pump_rx.recv().await)
            }
        };

        let received = tokio::select! {
            _ = cancel_token.cancelled() => {
                stream_task.abort();
                let _ = events.send(StreamResult::Cancelled {
                    conversation_id,
                    message_id,
                });
                return;
            }
            timed = recv => match timed {
                Ok(received) => received,
                Err(()) => {
                    stream_task.abort();
                    let _ = events.send(StreamResult::Error {
                        conversation_id,
                        message_id,
                        error: ChatError::StreamInterrupted(
                            "Timed out waiting for first token".into(),
                        ),
                    });
                    return;
                }
            }
        };
        first = false;

        match received {
            Some(Pump::Event(StreamEvent::Token(token))) => {
                accumulated.push_str(&token);
                let _ = events.send(StreamResult::Token {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                    accumulated: accumulated.clone(),
                });
            }
            Some(Pump::Event(StreamEvent::Done {
                tokens_in,
                tokens_out,
            })) => {
                let _ = events.send(StreamResult::Done {
                    conversation_id,
                    message_id,
                    full_content: accumulated,
                    tokens_in,
                    tokens_out,
                });
                return;
            }
            Some(Pump::Event(StreamEvent::Error(error))) => {
                let _ = events.send(StreamResult::Error {
                    conversation_id,
                    message_id,
                    error: ChatError::StreamInterrupted(error),
                });
                return;
            }
            Some(Pump::Failed(error)) => {
                let _ = events.send(StreamResult::Error {
                    conversation_id,
                    message_id,
                    error: error.into(),
                });
                return;
            }
            None => {
                // Channel closed without a Done event: partial output is
                // discarded and the caller is offered a retry.
                let _ = events.send(StreamResult::Error {
                    conversation_id,
                    message_id,
                    error: ChatError::StreamInterrupted("Stream ended unexpectedly".into()),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn settings_with_anthropic_key() -> AppSettings {
        let mut settings = AppSettings::default();
        settings.credentials.anthropic_api_key = Some("sk-ant-test".into());
        settings
    }

    fn turn(model: &str) -> TurnRequest {
        TurnRequest {
            messages: vec![Message::user("Hello", Vec::new())],
            model: model.into(),
            system_prompt: None,
        }
    }

    #[test]
    fn empty_messages_is_bad_request() {
        let router = ProviderRouter::with_default_providers();
        let mut t = turn("claude-3-haiku-20240307");
        t.messages.clear();
        let err = prepare_turn(
            &router,
            &t,
            &CredentialOverrides::default(),
            &settings_with_anthropic_key(),
            "c1".into(),
            "m1".into(),
        )
        .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn missing_model_is_bad_request() {
        let router = ProviderRouter::with_default_providers();
        let err = prepare_turn(
            &router,
            &turn(""),
            &CredentialOverrides::default(),
            &settings_with_anthropic_key(),
            "c1".into(),
            "m1".into(),
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::BadRequest(_)));
    }

    #[test]
    fn unknown_model_fails_before_any_network_call() {
        let router = ProviderRouter::with_default_providers();
        let err = prepare_turn(
            &router,
            &turn("llama-x"),
            &CredentialOverrides::default(),
            &settings_with_anthropic_key(),
            "c1".into(),
            "m1".into(),
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::UnknownModel(_)));
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn missing_credential_is_401_without_credential_material() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let router = ProviderRouter::with_default_providers();
        let err = prepare_turn(
            &router,
            &turn("claude-3-haiku-20240307"),
            &CredentialOverrides::default(),
            &AppSettings::default(),
            "c1".into(),
            "m1".into(),
        )
        .unwrap_err();
        assert_eq!(err.status(), 401);
        assert!(!err.to_string().contains("sk-"));
    }

    #[test]
    fn conversation_prompt_overrides_global() {
        let router = ProviderRouter::with_default_providers();
        let mut settings = settings_with_anthropic_key();
        settings.system_prompt = Some("global".into());
        let mut t = turn("claude-3-haiku-20240307");
        t.system_prompt = Some("per-conversation".into());
        let params = prepare_turn(
            &router,
            &t,
            &CredentialOverrides::default(),
            &settings,
            "c1".into(),
            "m1".into(),
        )
        .unwrap();
        assert_eq!(
            params.request.system_prompt.as_deref(),
            Some("per-conversation")
        );
    }

    #[test]
    fn error_body_serializes_message_and_status() {
        let err = ChatError::UnknownModel("llama-x".into());
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["status"], 400);
        assert!(body["message"].as_str().unwrap().contains("llama-x"));
    }

    mod streaming {
        use super::*;
        use async_trait::async_trait;

        use crate::models::Role;
        use crate::providers::ProviderMessage;

        struct ScriptedProvider;

        #[async_trait]
        impl AiProvider for ScriptedProvider {
            fn family(&self) -> ProviderFamily {
                ProviderFamily::OpenAi
            }

            async fn complete(&self, _request: ChatRequest) -> Result<String, ProviderError> {
                Ok(String::new())
            }

            async fn stream_chat(
                &self,
                _request: ChatRequest,
                tx: mpsc::Sender<StreamEvent>,
            ) -> Result<(), ProviderError> {
                let _ = tx.send(StreamEvent::Token("Hello ".into())).await;
                let _ = tx.send(StreamEvent::Token("world".into())).await;
                let _ = tx
                    .send(StreamEvent::Done {
                        tokens_in: Some(3),
                        tokens_out: Some(2),
                    })
                    .await;
                Ok(())
            }
        }

        /// Sends one token, then hangs until aborted.
        struct StallingProvider;

        #[async_trait]
        impl AiProvider for StallingProvider {
            fn family(&self) -> ProviderFamily {
                ProviderFamily::OpenAi
            }

            async fn complete(&self, _request: ChatRequest) -> Result<String, ProviderError> {
                Ok(String::new())
            }

            async fn stream_chat(
                &self,
                _request: ChatRequest,
                tx: mpsc::Sender<StreamEvent>,
            ) -> Result<(), ProviderError> {
                let _ = tx.send(StreamEvent::Token("partial out".into())).await;
                futures::future::pending::<()>().await;
                Ok(())
            }
        }

        /// Never produces anything.
        struct SilentProvider;

        #[async_trait]
        impl AiProvider for SilentProvider {
            fn family(&self) -> ProviderFamily {
                ProviderFamily::OpenAi
            }

            async fn complete(&self, _request: ChatRequest) -> Result<String, ProviderError> {
                Ok(String::new())
            }

            async fn stream_chat(
                &self,
                _request: ChatRequest,
                _tx: mpsc::Sender<StreamEvent>,
            ) -> Result<(), ProviderError> {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }

        fn params(provider: Arc<dyn AiProvider>) -> ChatDispatchParams {
            ChatDispatchParams {
                request: ChatRequest {
                    api_key: "sk-test".into(),
                    model: "gpt-4o-mini".into(),
                    messages: vec![ProviderMessage::text(Role::User, "hi")],
                    system_prompt: None,
                    temperature: None,
                    max_tokens: None,
                },
                provider,
                conversation_id: "c1".into(),
                message_id: "m1".into(),
            }
        }

        #[tokio::test]
        async fn tokens_accumulate_and_stream_completes() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            run_streaming(params(Arc::new(ScriptedProvider)), CancellationToken::new(), tx).await;

            let mut results = Vec::new();
            while let Some(r) = rx.recv().await {
                results.push(r);
            }
            assert!(matches!(
                &results[0],
                StreamResult::Token { accumulated, .. } if accumulated == "Hello "
            ));
            match results.last().unwrap() {
                StreamResult::Done {
                    full_content,
                    tokens_out,
                    ..
                } => {
                    assert_eq!(full_content, "Hello world");
                    assert_eq!(*tokens_out, Some(2));
                }
                other => panic!("expected Done, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn cancellation_reports_cancelled_and_never_done() {
            let token = CancellationToken::new();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let pump = tokio::spawn(run_streaming(
                params(Arc::new(StallingProvider)),
                token.clone(),
                tx,
            ));

            // Cancel mid-stream, after the first token has been buffered
            let first = rx.recv().await.unwrap();
            assert!(matches!(first, StreamResult::Token { .. }));
            token.cancel();
            pump.await.unwrap();

            let mut saw_cancelled = false;
            while let Some(r) = rx.recv().await {
                match r {
                    StreamResult::Cancelled { .. } => saw_cancelled = true,
                    StreamResult::Done { .. } => panic!("partial content must not complete"),
                    _ => {}
                }
            }
            assert!(saw_cancelled);
        }

        #[tokio::test(start_paused = true)]
        async fn first_token_timeout_is_a_retryable_interruption() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            run_streaming(params(Arc::new(SilentProvider)), CancellationToken::new(), tx).await;

            match rx.recv().await.unwrap() {
                StreamResult::Error { error, .. } => {
                    assert!(matches!(error, ChatError::StreamInterrupted(_)));
                    assert!(error.is_retryable());
                }
                other => panic!("expected Error, got {:?}", other),
            }
        }

        #[test]
        fn dispatch_params_debug_redacts_credentials() {
            let out = format!("{:?}", params(Arc::new(ScriptedProvider)));
            assert!(out.contains("openai"));
            assert!(!out.contains("sk-test"));
        }
    }
}
