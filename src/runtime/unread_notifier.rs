use crate::application_impl::resolve_username;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::runtime::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Watches the user's chat list and raises a local notification whenever
/// someone else's message leaves a conversation unread.
pub struct UnreadNotifier {
    store: Arc<dyn DocumentStore>,
    sink: Arc<dyn NotificationSink>,
    user: UserId,
    cancellation_token: CancellationToken,
    // last message already announced per chat; other members' reads also
    // modify a group summary
    announced: HashMap<ChatId, Timestamp>,
}

impl UnreadNotifier {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn NotificationSink>,
        user: UserId,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            sink,
            user,
            cancellation_token,
            announced: HashMap::new(),
        }
    }

    async fn handle(&mut self, doc: &Document) {
        let summary: ConversationSummary = match doc.decode() {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed conversation summary");
                return;
            }
        };
        let Some(sender) = summary.last_message_sender_id() else {
            return;
        };
        if *sender == self.user || !summary.is_unread_for(&self.user) {
            return;
        }
        let timestamp = summary.last_message_timestamp();
        if self
            .announced
            .get(summary.chat_id())
            .is_some_and(|announced| *announced >= timestamp)
        {
            return;
        }
        self.announced.insert(summary.chat_id().clone(), timestamp);

        let title = resolve_username(self.store.as_ref(), sender).await;
        let notification = LocalNotification {
            chat_id: summary.chat_id().clone(),
            sender_id: sender.clone(),
            title,
            body: summary.last_message_content().to_owned(),
        };
        self.sink.notify(&self.user, notification).await;
    }

    pub async fn run(mut self) -> Result<(), StoreError> {
        let query =
            Query::collection(CHATS).where_array_contains("participants", self.user.as_str());
        let mut feed = self.store.subscribe(query).await?;
        tracing::debug!(user = %self.user, "unread notifier started");

        loop {
            let changes = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    tracing::debug!(user = %self.user, "unread notifier shutting down...");
                    break;
                }
                changes = feed.next() => changes,
            };
            match changes {
                // only modifications are new messages
                Some(Ok(changes)) => {
                    for doc in &changes.modified {
                        self.handle(doc).await;
                    }
                }
                Some(Err(e)) => tracing::error!(user = %self.user, "chat list feed error: {:#?}", e),
                None => break,
            }
        }
        feed.cancel();
        Ok(())
    }
}
