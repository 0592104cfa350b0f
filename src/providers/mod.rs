pub mod anthropic;
pub mod format;
pub mod gemini;
pub mod openai;
pub mod router;
pub mod traits;
pub mod types;

pub use format::format_messages;
pub use router::{CredentialOverrides, ProviderFamily, ProviderRouter, RoutingError};
pub use traits::AiProvider;
pub use types::{ChatRequest, MessagePart, ProviderError, ProviderMessage, StreamEvent};
