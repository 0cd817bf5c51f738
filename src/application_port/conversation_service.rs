use crate::application_port::ReceiptError;
use crate::domain_model::*;
use crate::domain_port::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("conversation not found: {0}")]
    DocumentMissing(String),
    #[error("user not a member of conversation")]
    NotMember,
    #[error("{0} is not a group conversation")]
    NotGroup(ChatId),
    #[error("a group needs at least two distinct participants")]
    InvalidParticipants,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("read receipts: {0}")]
    Receipt(#[from] ReceiptError),
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DocumentMissing(path) => ChatError::DocumentMissing(path),
            StoreError::Decode { path, reason } => ChatError::Decode(format!("{path}: {reason}")),
            StoreError::Encode(reason) => ChatError::Decode(reason),
            other => ChatError::StoreUnavailable(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
pub trait ConversationService: Send + Sync {
    async fn send_direct_message(
        &self,
        sender: &UserId,
        recipient: &UserId,
        content: &str,
    ) -> Result<Message, ChatError>;

    async fn send_group_message(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        content: &str,
    ) -> Result<Message, ChatError>;

    async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<GroupSummary, ChatError>;

    /// Deletes every message, then the summary.
    async fn delete_group(&self, chat_id: &ChatId) -> Result<(), ChatError>;
}
