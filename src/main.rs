mod models;
mod providers;
mod services;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use providers::ProviderRouter;
use services::chat::StreamResult;
use services::export;
use services::{ChatSession, FileStore, SessionEvent, SettingsService};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

fn settings_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").expect("HOME not set");
            PathBuf::from(home).join(".local/share")
        });
    data_dir.join("parley").join("settings.json")
}

fn print_help() {
    println!("commands:");
    println!("  /new [model]      start a new conversation");
    println!("  /list             list conversations");
    println!("  /open <id>        switch to a conversation");
    println!("  /model <id>       change the model for this conversation");
    println!("  /title <text>     rename this conversation");
    println!("  /pin  /archive    toggle pin / archive");
    println!("  /delete           delete this conversation");
    println!("  /retry            retry the last failed turn");
    println!("  /cancel           cancel the in-flight turn");
    println!("  /export <md|json> export this conversation to a file");
    println!("  /quit             exit");
    println!("anything else is sent as a message");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = SettingsService::load(&settings_path()).await;
    let gateway = FileStore::open_default().await?;
    let router = Arc::new(ProviderRouter::with_default_providers());

    let (mut session, mut events) = ChatSession::new(router, gateway, settings);
    session.init().await?;

    if let Some(recent) = session.store.list().first().map(|c| c.id.clone()) {
        session.store.select(&recent)?;
        let conv = session.store.get(&recent).unwrap();
        println!("resuming \"{}\" ({})", conv.title, conv.model);
    } else {
        println!("no conversations yet; /new to start, /help for commands");
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut echo = StreamEcho::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Err(e) = handle_line(&mut session, &line).await {
                    println!("error: {}", e);
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                render_event(&session, &event, &mut echo);
                session.handle_event(event).await;
            }
        }
    }

    Ok(())
}

/// How much of the streaming assistant message is already on screen. The
/// offset is only meaningful for the message it was recorded against; a
/// token for any other message restarts from zero.
#[derive(Default)]
struct StreamEcho {
    message_id: Option<String>,
    printed: usize,
}

impl StreamEcho {
    fn reset(&mut self) {
        self.message_id = None;
        self.printed = 0;
    }
}

/// Echo streaming progress for the active conversation to stdout.
fn render_event(session: &ChatSession, event: &SessionEvent, echo: &mut StreamEcho) {
    let active = session.store.active_id();
    match event {
        SessionEvent::Stream(StreamResult::Token {
            conversation_id,
            message_id,
            accumulated,
        }) if Some(conversation_id.as_str()) == active => {
            if echo.message_id.as_deref() != Some(message_id.as_str()) {
                echo.message_id = Some(message_id.clone());
                echo.printed = 0;
            }
            print!("{}", &accumulated[echo.printed..]);
            let _ = std::io::stdout().flush();
            echo.printed = accumulated.len();
        }
        SessionEvent::Stream(StreamResult::Done {
            conversation_id, ..
        }) if Some(conversation_id.as_str()) == active => {
            println!();
            echo.reset();
        }
        SessionEvent::Stream(StreamResult::Cancelled {
            conversation_id, ..
        }) if Some(conversation_id.as_str()) == active => {
            println!("\n(cancelled)");
            echo.reset();
        }
        SessionEvent::Stream(StreamResult::Error {
            conversation_id,
            error,
            ..
        }) if Some(conversation_id.as_str()) == active => {
            println!("\nerror: {} (/retry to try again)", error);
            echo.reset();
        }
        SessionEvent::TitleReady { title, .. } => {
            println!("(titled: {})", title);
        }
        _ => {}
    }
}

async fn handle_line(session: &mut ChatSession, line: &str) -> Result<()> {
    let (cmd, rest) = match line.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    if !cmd.starts_with('/') {
        let id = match session.store.active_id() {
            Some(id) => id.to_string(),
            None => {
                let id = session.create_conversation(DEFAULT_MODEL).await?;
                session.store.select(&id)?;
                id
            }
        };
        return session.send_message(&id, line, Vec::new()).await;
    }

    match cmd {
        "/help" => print_help(),
        "/new" => {
            let model = if rest.is_empty() { DEFAULT_MODEL } else { rest };
            let id = session.create_conversation(model).await?;
            session.store.select(&id)?;
            println!("new conversation ({})", model);
        }
        "/list" => {
            for conv in session.store.list() {
                let marker = if Some(conv.id.as_str()) == session.store.active_id() {
                    "*"
                } else {
                    " "
                };
                let pin = if conv.pinned { " [pinned]" } else { "" };
                println!("{} {}  {}{} ({})", marker, conv.id, conv.title, pin, conv.model);
            }
        }
        "/open" => {
            session.store.select(rest)?;
            let conv = session.store.get(rest).unwrap();
            println!("switched to \"{}\"", conv.title);
            for msg in &conv.messages {
                println!("[{}] {}", msg.role.as_str(), msg.content);
            }
        }
        "/model" => {
            let id = require_active(session)?;
            session.set_model(&id, rest).await?;
        }
        "/title" => {
            let id = require_active(session)?;
            session.rename_conversation(&id, rest).await?;
        }
        "/pin" => {
            let id = require_active(session)?;
            session.toggle_pin(&id).await?;
        }
        "/archive" => {
            let id = require_active(session)?;
            session.toggle_archive(&id).await?;
        }
        "/delete" => {
            let id = require_active(session)?;
            session.delete_conversation(&id).await?;
            println!("deleted");
        }
        "/retry" => {
            let id = require_active(session)?;
            session.retry(&id).await?;
        }
        "/cancel" => {
            let id = require_active(session)?;
            session.cancel(&id);
        }
        "/export" => {
            let id = require_active(session)?;
            let conv = session.store.get(&id).unwrap();
            let (name, body) = match rest {
                "json" => (
                    export::export_filename(conv, "json"),
                    export::export_to_json(conv)?,
                ),
                _ => (
                    export::export_filename(conv, "md"),
                    export::export_to_markdown(conv),
                ),
            };
            tokio::fs::write(&name, body).await?;
            println!("exported to {}", name);
        }
        other => println!("unknown command {} (/help for commands)", other),
    }
    Ok(())
}

fn require_active(session: &ChatSession) -> Result<String> {
    session
        .store
        .active_id()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("No conversation selected; /new or /open first"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::AppSettings;

    fn token(conversation_id: &str, message_id: &str, accumulated: &str) -> SessionEvent {
        SessionEvent::Stream(StreamResult::Token {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            accumulated: accumulated.into(),
        })
    }

    async fn session() -> (tempfile::TempDir, ChatSession) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FileStore::new(dir.path()).await.unwrap();
        let (session, _rx) = ChatSession::new(
            Arc::new(ProviderRouter::new()),
            gateway,
            AppSettings::default(),
        );
        (dir, session)
    }

    #[tokio::test]
    async fn echo_offset_restarts_after_switching_conversations() {
        let (_dir, mut session) = session().await;
        let a = session.store.create("gpt-4o-mini");
        let b = session.store.create("gpt-4o-mini");
        session.store.select(&a).unwrap();

        let mut echo = StreamEcho::default();
        render_event(&session, &token(&a, "m-a", &"x".repeat(40)), &mut echo);
        assert_eq!(echo.printed, 40);

        // Switch away mid-stream, then start a new turn whose first token is
        // shorter than what conversation A had printed
        session.store.select(&b).unwrap();
        render_event(&session, &token(&b, "m-b", "hi"), &mut echo);
        assert_eq!(echo.printed, 2);
    }

    #[tokio::test]
    async fn background_stream_leaves_echo_untouched() {
        let (_dir, mut session) = session().await;
        let a = session.store.create("gpt-4o-mini");
        let b = session.store.create("gpt-4o-mini");
        session.store.select(&a).unwrap();

        let mut echo = StreamEcho::default();
        render_event(&session, &token(&a, "m-a", "active out"), &mut echo);
        let before = echo.printed;
        render_event(&session, &token(&b, "m-b", "background"), &mut echo);
        assert_eq!(echo.printed, before);
        assert_eq!(echo.message_id.as_deref(), Some("m-a"));
    }
}
