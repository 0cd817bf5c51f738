use crate::domain_model::*;

/// Notification raised on the device of the user it is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNotification {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// Sender's username.
    pub title: String,
    /// The summary's `lastMessageContent`.
    pub body: String,
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, recipient: &UserId, notification: LocalNotification);
}

/// Sink that only writes the notification to the log.
pub struct LogNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, recipient: &UserId, notification: LocalNotification) {
        tracing::info!(
            %recipient,
            chat_id = %notification.chat_id,
            title = %notification.title,
            body = %notification.body,
            "local notification"
        );
    }
}
