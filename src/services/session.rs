use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Attachment, Role};
use crate::providers::{AiProvider, CredentialOverrides, ProviderFamily, ProviderRouter};
use crate::services::chat::{self, StreamResult, TurnRequest};
use crate::services::persistence::FileStore;
use crate::services::settings::AppSettings;
use crate::services::store::{ConversationStore, TurnContext};
use crate::services::title;

/// Events delivered back to the session loop from spawned work.
#[derive(Debug)]
pub enum SessionEvent {
    Stream(StreamResult),
    TitleReady {
        conversation_id: String,
        title: String,
    },
}

/// Orchestrates the conversation store, provider routing, streaming turns,
/// and durable storage. All state mutation happens on the session loop via
/// `handle_event`; spawned tasks only send events back.
pub struct ChatSession {
    pub store: ConversationStore,
    pub settings: AppSettings,
    router: Arc<ProviderRouter>,
    gateway: FileStore,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cancel_tokens: HashMap<String, CancellationToken>,
}

impl ChatSession {
    pub fn new(
        router: Arc<ProviderRouter>,
        gateway: FileStore,
        settings: AppSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            store: ConversationStore::new(),
            settings,
            router,
            gateway,
            events_tx,
            cancel_tokens: HashMap::new(),
        };
        (session, events_rx)
    }

    /// Seed the store from durable storage.
    pub async fn init(&mut self) -> Result<()> {
        let conversations = self.gateway.list().await?;
        self.store.load(conversations);
        Ok(())
    }

    pub async fn create_conversation(&mut self, model: &str) -> Result<String> {
        let id = self.store.create(model);
        self.persist(&id).await;
        Ok(id)
    }

    pub async fn delete_conversation(&mut self, id: &str) -> Result<()> {
        self.cancel(id);
        self.store.remove(id)?;
        self.gateway.delete(id).await?;
        Ok(())
    }

    pub async fn rename_conversation(&mut self, id: &str, title: &str) -> Result<()> {
        self.store.rename(id, title)?;
        self.persist(id).await;
        Ok(())
    }

    pub async fn set_model(&mut self, id: &str, model: &str) -> Result<()> {
        self.store.set_model(id, model)?;
        self.persist(id).await;
        Ok(())
    }

    pub async fn set_system_prompt(&mut self, id: &str, prompt: Option<String>) -> Result<()> {
        self.store.set_system_prompt(id, prompt)?;
        self.persist(id).await;
        Ok(())
    }

    pub async fn toggle_pin(&mut self, id: &str) -> Result<()> {
        self.store.toggle_pin(id)?;
        self.persist(id).await;
        Ok(())
    }

    pub async fn toggle_archive(&mut self, id: &str) -> Result<()> {
        self.store.toggle_archive(id)?;
        self.persist(id).await;
        Ok(())
    }

    /// Append a user message and start streaming the reply.
    pub async fn send_message(
        &mut self,
        id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        let ctx = self.store.begin_send(id, content, attachments)?;
        self.persist(id).await;
        self.dispatch(ctx)
    }

    /// Discard the target assistant reply and stream a fresh one.
    pub async fn regenerate(&mut self, id: &str, assistant_msg_id: &str) -> Result<()> {
        let ctx = self.store.begin_regenerate(id, assistant_msg_id)?;
        self.persist(id).await;
        self.dispatch(ctx)
    }

    /// Replace a user message, discard everything after it, and re-stream.
    pub async fn edit_message(&mut self, id: &str, msg_id: &str, content: &str) -> Result<()> {
        let ctx = self.store.begin_edit(id, msg_id, content)?;
        self.persist(id).await;
        self.dispatch(ctx)
    }

    /// Re-issue the identical request after a failed turn.
    pub async fn retry(&mut self, id: &str) -> Result<()> {
        let ctx = self.store.begin_retry(id)?;
        self.dispatch(ctx)
    }

    /// Abort the in-flight turn for a conversation, if any.
    pub fn cancel(&mut self, id: &str) {
        if let Some(token) = self.cancel_tokens.get(id) {
            token.cancel();
        }
    }

    fn dispatch(&mut self, ctx: TurnContext) -> Result<()> {
        let conv = self
            .store
            .get(&ctx.conversation_id)
            .ok_or_else(|| anyhow::anyhow!("Conversation vanished before dispatch"))?;
        let turn = TurnRequest {
            messages: ctx.messages,
            model: conv.model.clone(),
            system_prompt: conv.system_prompt.clone(),
        };

        let params = match chat::prepare_turn(
            &self.router,
            &turn,
            &CredentialOverrides::default(),
            &self.settings,
            ctx.conversation_id.clone(),
            ctx.message_id.clone(),
        ) {
            Ok(params) => params,
            Err(e) => {
                self.store
                    .fail_turn(&ctx.conversation_id, &ctx.message_id, e.to_string());
                return Err(e.into());
            }
        };

        let token = CancellationToken::new();
        self.cancel_tokens
            .insert(ctx.conversation_id.clone(), token.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(chat::run_streaming(params, token, tx));

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                if events_tx.send(SessionEvent::Stream(result)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Apply one event from a spawned task to the authoritative state.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Stream(StreamResult::Token {
                conversation_id,
                message_id,
                accumulated,
            }) => {
                self.store
                    .apply_token(&conversation_id, &message_id, accumulated);
            }
            SessionEvent::Stream(StreamResult::Done {
                conversation_id,
                message_id,
                full_content,
                tokens_in,
                tokens_out,
            }) => {
                tracing::debug!(
                    "Turn complete for {}: {:?} in, {:?} out",
                    conversation_id,
                    tokens_in,
                    tokens_out
                );
                if self.store.commit(&conversation_id, &message_id, full_content) {
                    self.cancel_tokens.remove(&conversation_id);
                    self.persist(&conversation_id).await;
                    self.maybe_generate_title(&conversation_id);
                }
            }
            SessionEvent::Stream(StreamResult::Cancelled {
                conversation_id, ..
            }) => {
                self.store.cancel_turn(&conversation_id);
                self.cancel_tokens.remove(&conversation_id);
            }
            SessionEvent::Stream(StreamResult::Error {
                conversation_id,
                message_id,
                error,
            }) => {
                tracing::warn!("Turn failed for {}: {}", conversation_id, error);
                self.store
                    .fail_turn(&conversation_id, &message_id, error.to_string());
                self.cancel_tokens.remove(&conversation_id);
            }
            SessionEvent::TitleReady {
                conversation_id,
                title,
            } => {
                if self.store.rename(&conversation_id, &title).is_ok() {
                    self.persist(&conversation_id).await;
                }
            }
        }
    }

    /// Schedule a one-time title generation after the first completed turn.
    fn maybe_generate_title(&mut self, id: &str) {
        if !self.store.try_schedule_title(id) {
            return;
        }
        let Some(conv) = self.store.get(id) else {
            return;
        };
        let first_user = conv
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let provider = self.title_provider(&conv.model);
        let conversation_id = id.to_string();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let title = title::generate_title(provider, &first_user).await;
            let _ = events_tx.send(SessionEvent::TitleReady {
                conversation_id,
                title,
            });
        });
    }

    /// Best-effort provider handle for title generation; None falls back to
    /// the local heuristic.
    fn title_provider(&self, model: &str) -> Option<(Arc<dyn AiProvider>, String, String)> {
        let family = ProviderFamily::for_model(model).ok()?;
        let api_key = ProviderRouter::resolve_credential(
            family,
            &CredentialOverrides::default(),
            &self.settings.credentials,
        )
        .ok()?;
        let provider = self.router.resolve_provider(model).ok()?;
        Some((provider, model.to_string(), api_key))
    }

    async fn persist(&self, id: &str) {
        if let Some(snapshot) = self.store.snapshot(id) {
            if let Err(e) = self.gateway.put(&snapshot).await {
                tracing::error!("Failed to persist conversation {}: {}", id, e);
            }
        }
    }
}
