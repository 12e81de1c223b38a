pub mod conversation;
pub mod dialog;
pub mod manager;
pub mod retry;

pub use conversation::{Conversation, ConversationContext, ConversationSettings};
pub use dialog::Dialog;
pub use manager::ConversationManager;
pub use retry::{retry, RetryPolicy};
