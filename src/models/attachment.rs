use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum decoded payload size for a single attachment.
pub const MAX_ATTACHMENT_BYTES: usize = 15 * 1024 * 1024;

const ACCEPTED_IMAGE_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

const ACCEPTED_DOCUMENT_MIME: &[&str] = &[
    "text/plain",
    "text/markdown",
    "text/csv",
    "text/html",
    "application/json",
    "application/pdf",
];

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Unsupported MIME type: {0}")]
    UnsupportedMime(String),

    #[error("Attachment too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Payload is not valid base64")]
    InvalidPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub filename: String,
    pub mime_type: String,
    /// Payload, base64-encoded.
    pub data: String,
    /// Local preview handle for images. Never persisted.
    #[serde(skip)]
    pub preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    /// Validate and build an attachment from a base64 payload. Size and MIME
    /// checks happen here, before the attachment can reach a pending message.
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<Self, AttachmentError> {
        let mime_type = mime_type.into();
        let data = data.into();

        let kind = Self::kind_for_mime(&mime_type)
            .ok_or_else(|| AttachmentError::UnsupportedMime(mime_type.clone()))?;

        let decoded_len = base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|_| AttachmentError::InvalidPayload)?
            .len();
        if decoded_len > MAX_ATTACHMENT_BYTES {
            return Err(AttachmentError::TooLarge {
                size: decoded_len,
                limit: MAX_ATTACHMENT_BYTES,
            });
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            filename: filename.into(),
            mime_type,
            data,
            preview: None,
            created_at: Utc::now(),
        })
    }

    /// Convenience constructor for raw bytes.
    pub fn from_bytes(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Result<Self, AttachmentError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::new(filename, mime_type, encoded)
    }

    fn kind_for_mime(mime: &str) -> Option<AttachmentKind> {
        if ACCEPTED_IMAGE_MIME.contains(&mime) {
            Some(AttachmentKind::Image)
        } else if ACCEPTED_DOCUMENT_MIME.contains(&mime) {
            Some(AttachmentKind::Document)
        } else {
            None
        }
    }
}
