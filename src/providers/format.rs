use base64::Engine;

use super::types::{MessagePart, ProviderMessage};
use crate::models::{AttachmentKind, Message, Role};

/// Convert application messages into the provider-neutral multi-part shape.
///
/// System-role messages are excluded here; the system prompt travels on its
/// own channel. User attachments become parts after the text part, in their
/// original order. Assistant attachments are not supported by the wire
/// format and are silently dropped.
pub fn format_messages(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(format_one)
        .collect()
}

fn format_one(msg: &Message) -> ProviderMessage {
    if msg.role != Role::User || msg.attachments.is_empty() {
        return ProviderMessage::text(msg.role, msg.content.clone());
    }

    let mut parts = Vec::with_capacity(msg.attachments.len() + 1);
    if !msg.content.is_empty() {
        parts.push(MessagePart::Text {
            text: msg.content.clone(),
        });
    }

    for att in &msg.attachments {
        match att.kind {
            AttachmentKind::Image => parts.push(MessagePart::InlineImage {
                mime_type: att.mime_type.clone(),
                data: att.data.clone(),
            }),
            AttachmentKind::Document => parts.push(MessagePart::Text {
                text: document_as_text(&att.filename, &att.data),
            }),
        }
    }

    ProviderMessage {
        role: msg.role,
        parts,
    }
}

/// Inline a document attachment as text. Falls back to the bare filename
/// label when the payload does not decode as UTF-8; never fails.
fn document_as_text(filename: &str, data: &str) -> String {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());

    match decoded {
        Some(text) => format!("[file: {}]\n{}", filename, text),
        None => format!("[file: {}]", filename),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Attachment;

    fn image() -> Attachment {
        Attachment::from_bytes("pic.png", "image/png", b"\x89PNG").unwrap()
    }

    fn document(bytes: &[u8]) -> Attachment {
        Attachment::from_bytes("notes.txt", "text/plain", bytes).unwrap()
    }

    #[test]
    fn plain_message_is_single_text_part() {
        let msgs = vec![Message::user("Hello", Vec::new())];
        let out = format_messages(&msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(
            out[0].parts,
            vec![MessagePart::Text {
                text: "Hello".into()
            }]
        );
    }

    #[test]
    fn attachments_follow_text_in_original_order() {
        let msgs = vec![Message::user(
            "look at these",
            vec![image(), document(b"some notes")],
        )];
        let out = format_messages(&msgs);
        assert_eq!(out[0].parts.len(), 3);
        assert!(matches!(out[0].parts[0], MessagePart::Text { .. }));
        assert!(matches!(out[0].parts[1], MessagePart::InlineImage { .. }));
        match &out[0].parts[2] {
            MessagePart::Text { text } => {
                assert!(text.starts_with("[file: notes.txt]"));
                assert!(text.contains("some notes"));
            }
            other => panic!("expected text part, got {:?}", other),
        }
    }

    #[test]
    fn empty_content_omits_leading_text_part() {
        let msgs = vec![Message::user("", vec![image()])];
        let out = format_messages(&msgs);
        assert_eq!(out[0].parts.len(), 1);
        assert!(matches!(out[0].parts[0], MessagePart::InlineImage { .. }));
    }

    #[test]
    fn non_utf8_document_degrades_to_label() {
        let msgs = vec![Message::user("", vec![document(&[0xff, 0xfe, 0x00])])];
        let out = format_messages(&msgs);
        assert_eq!(
            out[0].parts,
            vec![MessagePart::Text {
                text: "[file: notes.txt]".into()
            }]
        );
    }

    #[test]
    fn assistant_attachments_are_dropped() {
        let mut msg = Message::assistant("a1".into(), "answer");
        msg.attachments = vec![image()];
        let out = format_messages(&[msg]);
        assert_eq!(
            out[0].parts,
            vec![MessagePart::Text {
                text: "answer".into()
            }]
        );
    }

    #[test]
    fn system_messages_are_excluded() {
        let mut sys = Message::user("be terse", Vec::new());
        sys.role = Role::System;
        let out = format_messages(&[sys, Message::user("hi", Vec::new())]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
    }
}
