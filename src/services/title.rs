use std::sync::Arc;

use crate::providers::{AiProvider, ChatRequest, ProviderMessage};
use crate::models::Role;

/// Sentinel title for conversations that have not been named yet.
pub const UNTITLED: &str = "New Chat";

const MAX_TITLE_CHARS: usize = 50;
const TRUNCATE_AT: usize = 47;

const TITLE_INSTRUCTION: &str = "Generate a short title for the following conversation \
opener. Reply with the title only, in the same language as the input, at most 50 \
characters, without surrounding quotes.";

/// Derive a conversation title from the first user message. Never fails from
/// the caller's point of view: any provider error degrades to the local
/// heuristic.
pub async fn generate_title(
    provider: Option<(Arc<dyn AiProvider>, String, String)>,
    first_user_message: &str,
) -> String {
    if let Some((provider, model, api_key)) = provider {
        let request = ChatRequest {
            api_key,
            model,
            messages: vec![ProviderMessage::text(Role::User, first_user_message)],
            system_prompt: Some(TITLE_INSTRUCTION.to_string()),
            temperature: None,
            max_tokens: Some(64),
        };

        match provider.complete(request).await {
            Ok(raw) => {
                let title = clean_generated_title(&raw);
                if !title.is_empty() {
                    return title;
                }
            }
            Err(e) => {
                tracing::debug!("Title generation failed, using fallback: {}", e);
            }
        }
    }

    fallback_title(first_user_message)
}

fn clean_generated_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(['"', '\'', '\u{201c}', '\u{201d}']);
    clamp_title(trimmed)
}

/// Deterministic local heuristic: collapse whitespace, cut at the first
/// sentence-terminal mark when it falls within the length budget, otherwise
/// hard-truncate with an ellipsis.
pub fn fallback_title(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return UNTITLED.to_string();
    }

    for (count, (idx, c)) in collapsed.char_indices().enumerate() {
        if count >= MAX_TITLE_CHARS {
            break;
        }
        if matches!(c, '.' | '!' | '?' | '\u{3002}' | '\u{ff01}' | '\u{ff1f}') {
            return collapsed[..idx + c.len_utf8()].to_string();
        }
    }

    clamp_title(&collapsed)
}

/// Enforce the 50-character bound, truncating to 47 characters plus an
/// ellipsis on a char boundary.
fn clamp_title(text: &str) -> String {
    if text.chars().count() <= MAX_TITLE_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(TRUNCATE_AT).collect();
    format!("{}...", truncated)
}
