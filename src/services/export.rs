use chrono::Utc;
use serde_json::json;

use crate::models::{Conversation, Role};

const MAX_FILENAME_TITLE_CHARS: usize = 50;

pub fn export_to_markdown(conversation: &Conversation) -> String {
    let mut output = format!("# {}\n\n", conversation.title);
    output.push_str(&format!(
        "> Model: {} | Date: {}\n\n",
        conversation.model,
        conversation.created_at.format("%Y-%m-%d %H:%M")
    ));

    if let Some(prompt) = &conversation.system_prompt {
        output.push_str(&format!("> System Prompt: {}\n\n", prompt));
    }

    output.push_str("---\n\n");

    for msg in &conversation.messages {
        let role_label = match msg.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        output.push_str(&format!(
            "### {} ({})\n\n{}\n\n",
            role_label,
            msg.created_at.format("%Y-%m-%d %H:%M"),
            msg.content
        ));
    }

    output
}

pub fn export_to_json(conversation: &Conversation) -> serde_json::Result<String> {
    let doc = json!({
        "format": "parley-export",
        "version": 1,
        "exported_at": Utc::now(),
        "conversation": conversation,
    });
    serde_json::to_string_pretty(&doc)
}

/// Build a filesystem-safe filename from the conversation title:
/// `{title}_{YYYYMMDD}.{ext}` with unsafe characters stripped and
/// whitespace collapsed to underscores.
pub fn export_filename(conversation: &Conversation, extension: &str) -> String {
    let mut cleaned = String::new();
    for c in conversation.title.chars() {
        if c.is_whitespace() {
            if !cleaned.ends_with('_') {
                cleaned.push('_');
            }
        } else if c.is_alphanumeric() || matches!(c, '_' | '-') {
            cleaned.push(c);
        }
    }
    let cleaned: String = cleaned
        .trim_matches('_')
        .chars()
        .take(MAX_FILENAME_TITLE_CHARS)
        .collect();

    let stem = if cleaned.is_empty() {
        "conversation".to_string()
    } else {
        cleaned
    };

    format!("{}_{}.{}", stem, Utc::now().format("%Y%m%d"), extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn sample() -> Conversation {
        let mut conv = Conversation::new("Sorting vectors", "gpt-4o-mini");
        conv.system_prompt = Some("Be concise.".into());
        conv.messages.push(Message::user("How do I sort?", Vec::new()));
        conv.messages
            .push(Message::assistant("a-1".into(), "Use sort_by."));
        conv
    }

    #[test]
    fn markdown_contains_header_and_transcript() {
        let md = export_to_markdown(&sample());
        assert!(md.starts_with("# Sorting vectors\n"));
        assert!(md.contains("> Model: gpt-4o-mini"));
        assert!(md.contains("> System Prompt: Be concise."));
        assert!(md.contains("How do I sort?"));
        assert!(md.contains("Use sort_by."));
        assert!(md.find("### You").unwrap() < md.find("### Assistant").unwrap());
    }

    #[test]
    fn markdown_omits_missing_system_prompt() {
        let mut conv = sample();
        conv.system_prompt = None;
        assert!(!export_to_markdown(&conv).contains("System Prompt"));
    }

    #[test]
    fn json_export_wraps_conversation_with_metadata() {
        let conv = sample();
        let out = export_to_json(&conv).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["format"], "parley-export");
        assert_eq!(value["version"], 1);
        assert!(value["exported_at"].is_string());
        assert_eq!(value["conversation"]["id"], conv.id.as_str());
        assert_eq!(value["conversation"]["messages"][1]["content"], "Use sort_by.");
    }

    #[test]
    fn filename_is_sanitized() {
        let mut conv = sample();
        conv.title = "What's up / with   lifetimes?".into();
        let name = export_filename(&conv, "md");
        assert!(name.starts_with("Whats_up_with_lifetimes_"));
        assert!(name.ends_with(".md"));
        assert!(!name.contains('/'));
        assert!(!name.contains('?'));
    }

    #[test]
    fn whitespace_runs_collapse_to_one_underscore() {
        let mut conv = sample();
        conv.title = "  spaced \t out\n title  ".into();
        let name = export_filename(&conv, "md");
        assert!(name.starts_with("spaced_out_title_2"));
        assert!(!name.contains("__"));
    }

    #[test]
    fn empty_title_falls_back() {
        let mut conv = sample();
        conv.title = "///".into();
        let name = export_filename(&conv, "json");
        assert!(name.starts_with("conversation_"));
    }
}
