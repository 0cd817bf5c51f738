use crate::domain_model::*;
use crate::domain_port::{Fields, StoreError, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("document missing: {0}")]
    DocumentMissing(String),
    #[error("{path} kept changing underneath after {attempts} attempts")]
    StaleMapWrite { path: String, attempts: u32 },
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<StoreError> for ReceiptError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DocumentMissing(path) => ReceiptError::DocumentMissing(path),
            StoreError::Decode { path, reason } => ReceiptError::Decode(format!("{path}: {reason}")),
            StoreError::Encode(reason) => ReceiptError::Decode(reason),
            other => ReceiptError::StoreUnavailable(other.to_string()),
        }
    }
}

/// What one `on_conversation_opened` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenReport {
    /// The summary-level flag (`userNSeen` or `seenStatus[reader]`) was written.
    pub summary_marked: bool,
    /// Messages flipped to seen.
    pub messages_marked: usize,
}

/// Standing receipt reconciliation for one open conversation screen.
/// Stops on `cancel` or when dropped.
pub struct ConversationWatch {
    passes: Subscription<usize>,
}

impl ConversationWatch {
    pub fn new(passes: Subscription<usize>) -> Self {
        Self { passes }
    }

    /// Number of messages marked by the next reconciliation pass.
    pub async fn next_pass(&mut self) -> Option<usize> {
        self.passes.next().await
    }

    pub fn cancel(&mut self) {
        self.passes.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.passes.is_active()
    }
}

#[async_trait::async_trait]
pub trait ReadReceiptService: Send + Sync {
    async fn on_conversation_opened(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        kind: ConversationKind,
    ) -> Result<SeenReport, ReceiptError>;

    /// Summary-level seen flags right after `sender` appended a message.
    async fn on_message_sent(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        participants: &[UserId],
    ) -> Result<(), ReceiptError> {
        self.record_message_sent(chat_id, sender, participants, Fields::new())
            .await
    }

    /// `on_message_sent` with `summary_fields` (the last-message fields)
    /// written in the same summary write as the seen flags.
    async fn record_message_sent(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        participants: &[UserId],
        summary_fields: Fields,
    ) -> Result<(), ReceiptError>;

    /// Marks the other participant's unseen messages among `messages` in one batch.
    async fn reconcile_direct(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        messages: &[Message],
    ) -> Result<usize, ReceiptError>;

    async fn mark_group_messages_seen(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
    ) -> Result<usize, ReceiptError>;

    /// Keeps reconciling while the conversation stays open.
    async fn watch(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        kind: ConversationKind,
    ) -> Result<ConversationWatch, ReceiptError>;
}
