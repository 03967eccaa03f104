pub mod messenger;

use async_trait::async_trait;

pub use messenger::SendError;

/// A text message received from the page's inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Page-scoped id of the person who wrote to the page
    pub sender_id: String,
    /// The message text
    pub text: String,
}

/// Delivers a reply to a person on the messaging platform.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), SendError>;
}
