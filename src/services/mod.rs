pub mod chat;
pub mod export;
pub mod persistence;
pub mod session;
pub mod settings;
pub mod store;
pub mod title;

pub use persistence::FileStore;
pub use session::{ChatSession, SessionEvent};
pub use settings::{AppSettings, SettingsService};
pub use store::ConversationStore;
