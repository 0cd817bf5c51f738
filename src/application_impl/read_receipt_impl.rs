use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::fields;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RealReadReceiptReconciler {
    store: Arc<dyn DocumentStore>,
    max_conflict_retries: u32,
}

impl RealReadReceiptReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            max_conflict_retries,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_conflict_retries + 1
    }

    async fn load_summary(&self, chat_id: &ChatId) -> Result<Document, ReceiptError> {
        let path = DocumentPath::chat(chat_id);
        self.store
            .get(&path)
            .await?
            .ok_or_else(|| ReceiptError::DocumentMissing(path.to_string()))
    }

    /// Sets the reader's `user1Seen`/`user2Seen`. Returns whether a write happened.
    async fn mark_direct_summary(&self, chat_id: &ChatId, reader: &UserId) -> Result<bool, ReceiptError> {
        let doc = self.load_summary(chat_id).await?;
        let summary: DirectSummary = doc.decode()?;
        let Some(role) = summary.role_of(reader) else {
            tracing::warn!(%chat_id, %reader, "reader holds no role in direct chat");
            return Ok(false);
        };
        if summary.seen_by(reader) == Some(true) {
            return Ok(false);
        }
        self.store
            .update(&doc.path, fields! { role.seen_field() => true }, Precondition::None)
            .await?;
        Ok(true)
    }

    /// `seenStatus[reader] = true` as a read-modify-write conditional on the
    /// version read, retried while other readers keep winning.
    async fn mark_group_summary(&self, chat_id: &ChatId, reader: &UserId) -> Result<bool, ReceiptError> {
        let path = DocumentPath::chat(chat_id);
        for attempt in 1..=self.attempts() {
            let doc = self.load_summary(chat_id).await?;
            let summary: GroupSummary = doc.decode()?;
            if !summary.is_participant(reader) {
                tracing::warn!(%chat_id, %reader, "reader is not a group participant");
                return Ok(false);
            }
            let mut seen_status = summary.seen_status_or_seeded(reader);
            if seen_status.get(reader) == Some(&true) && !summary.seen_status.is_empty() {
                return Ok(false);
            }
            seen_status.insert(reader.clone(), true);

            match self
                .store
                .update(
                    &path,
                    fields! { "seenStatus" => seen_status },
                    Precondition::Version(doc.version),
                )
                .await
            {
                Ok(()) => return Ok(true),
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(%path, attempt, "seenStatus changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReceiptError::StaleMapWrite {
            path: path.to_string(),
            attempts: self.attempts(),
        })
    }

    async fn unseen_direct_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, ReceiptError> {
        let query = Query::collection(messages_collection(chat_id)).where_eq("seen", false);
        let docs = self.store.query(&query).await?;
        Ok(decode_messages(&docs))
    }

    async fn mark_summary(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        kind: ConversationKind,
    ) -> Result<bool, ReceiptError> {
        match kind {
            ConversationKind::Direct => self.mark_direct_summary(chat_id, reader).await,
            ConversationKind::Group => self.mark_group_summary(chat_id, reader).await,
        }
    }
}

/// Typed messages; undecodable documents are logged and skipped.
fn decode_messages(docs: &[Document]) -> Vec<Message> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<Message>() {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed message");
                None
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl ReadReceiptService for RealReadReceiptReconciler {
    async fn on_conversation_opened(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        kind: ConversationKind,
    ) -> Result<SeenReport, ReceiptError> {
        let mut report = SeenReport::default();
        let mut first_error = None;

        match self.mark_summary(chat_id, reader, kind).await {
            Ok(marked) => report.summary_marked = marked,
            Err(e) => {
                tracing::warn!(%chat_id, %reader, error = %e, "cannot mark conversation seen");
                first_error.get_or_insert(e);
            }
        }

        let messages = match kind {
            ConversationKind::Direct => match self.unseen_direct_messages(chat_id).await {
                Ok(messages) => self.reconcile_direct(chat_id, reader, &messages).await,
                Err(e) => Err(e),
            },
            ConversationKind::Group => self.mark_group_messages_seen(chat_id, reader).await,
        };
        match messages {
            Ok(n) => report.messages_marked = n,
            Err(e) => {
                tracing::warn!(%chat_id, %reader, error = %e, "cannot mark messages seen");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(%chat_id, %reader, ?report, "conversation opened");
                Ok(report)
            }
        }
    }

    async fn record_message_sent(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        participants: &[UserId],
        mut summary_fields: Fields,
    ) -> Result<(), ReceiptError> {
        let path = DocumentPath::chat(chat_id);
        match participants {
            [a, b] if derive_one_to_one_id(a, b) == *chat_id => {
                let pair = UserPair::new(a.clone(), b.clone());
                summary_fields.extend(fields! {
                    "user1Id" => pair.first(),
                    "user2Id" => pair.second(),
                    "participants" => [pair.first(), pair.second()],
                    "user1Seen" => sender == pair.first(),
                    "user2Seen" => sender == pair.second(),
                });
                self.store.set(&path, summary_fields, SetMode::Merge).await?;
            }
            _ => {
                let seen_status = seed_seen_map(participants, sender);
                summary_fields.extend(fields! { "seenStatus" => seen_status });
                self.store
                    .update(&path, summary_fields, Precondition::None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn reconcile_direct(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        messages: &[Message],
    ) -> Result<usize, ReceiptError> {
        let mut batch = self.store.batch();
        for message in messages.iter().filter(|m| m.awaits_direct_receipt(reader)) {
            batch.update(
                DocumentPath::message(chat_id, &message.message_id),
                fields! { "seen" => true },
                Precondition::None,
            );
        }
        let marked = batch.len();
        if marked == 0 {
            return Ok(0);
        }
        batch.commit().await?;
        tracing::trace!(%chat_id, %reader, marked, "direct messages marked seen");
        Ok(marked)
    }

    async fn mark_group_messages_seen(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
    ) -> Result<usize, ReceiptError> {
        let collection = messages_collection(chat_id);
        for attempt in 1..=self.attempts() {
            let docs = self.store.query(&Query::collection(collection.as_str())).await?;

            let mut batch = self.store.batch();
            for doc in &docs {
                let message: Message = match doc.decode() {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed message");
                        continue;
                    }
                };
                let Some(seen_by) = message.seen_by_with(reader) else {
                    continue;
                };
                batch.update(
                    doc.path.clone(),
                    fields! { "seenBy" => seen_by },
                    Precondition::Version(doc.version),
                );
            }

            let marked = batch.len();
            if marked == 0 {
                return Ok(0);
            }
            match batch.commit().await {
                Ok(()) => {
                    tracing::trace!(%chat_id, %reader, marked, "group messages marked seen");
                    return Ok(marked);
                }
                Err(StoreError::VersionConflict { path, .. }) => {
                    tracing::debug!(%path, attempt, "seenBy changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReceiptError::StaleMapWrite {
            path: collection,
            attempts: self.attempts(),
        })
    }

    async fn watch(
        &self,
        chat_id: &ChatId,
        reader: &UserId,
        kind: ConversationKind,
    ) -> Result<ConversationWatch, ReceiptError> {
        let mut feed = self
            .store
            .subscribe(Query::collection(messages_collection(chat_id)))
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let reconciler = self.clone();
        let chat_id = chat_id.clone();
        let reader = reader.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            // 1:1 reconciliation runs over every message observed so far
            let mut observed: BTreeMap<String, Message> = BTreeMap::new();
            loop {
                let changes = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changes = feed.next() => changes,
                };
                let changes = match changes {
                    Some(Ok(changes)) => changes,
                    Some(Err(e)) => {
                        tracing::warn!(%chat_id, error = %e, "message feed error");
                        continue;
                    }
                    None => break,
                };
                for doc in &changes.removed {
                    observed.remove(doc.id());
                }
                let upserted: Vec<Document> = changes.upserted().cloned().collect();
                for message in decode_messages(&upserted) {
                    observed.insert(message.message_id.0.clone(), message);
                }

                let pass = match kind {
                    ConversationKind::Direct => {
                        let messages: Vec<Message> = observed.values().cloned().collect();
                        reconciler.reconcile_direct(&chat_id, &reader, &messages).await
                    }
                    ConversationKind::Group => {
                        if observed.values().all(|m| m.is_seen_by(&reader)) {
                            Ok(0)
                        } else {
                            reconciler.mark_group_messages_seen(&chat_id, &reader).await
                        }
                    }
                };
                let marked = match pass {
                    Ok(marked) => marked,
                    Err(e) => {
                        tracing::warn!(%chat_id, %reader, error = %e, "receipt pass failed");
                        0
                    }
                };
                if marked > 0 {
                    if let Err(e) = reconciler.mark_summary(&chat_id, &reader, kind).await {
                        tracing::warn!(%chat_id, %reader, error = %e, "cannot mark conversation seen");
                    }
                }
                if tx.send(marked).is_err() {
                    break;
                }
            }
            feed.cancel();
            tracing::trace!(%chat_id, %reader, "conversation watch stopped");
        });

        Ok(ConversationWatch::new(Subscription::new(rx, Box::new(cancel))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::MemoryDocumentStore;
    use std::time::Duration;

    fn uid(s: &str) -> UserId {
        UserId::from(s)
    }

    fn setup() -> (Arc<MemoryDocumentStore>, RealReadReceiptReconciler) {
        let store = Arc::new(MemoryDocumentStore::new());
        let reconciler = RealReadReceiptReconciler::new(store.clone(), 5);
        (store, reconciler)
    }

    async fn put_direct(store: &MemoryDocumentStore, sender: &str, receiver: &str, content: &str) -> Message {
        let chat_id = derive_one_to_one_id(&uid(sender), &uid(receiver));
        let mut message = Message::new_direct(chat_id.clone(), uid(sender), uid(receiver), content);
        let path = store
            .add(&messages_collection(&chat_id), encode(&message).unwrap())
            .await
            .unwrap();
        message.message_id = MessageId(path.id);
        message
    }

    async fn put_group(store: &MemoryDocumentStore, chat_id: &ChatId, members: &[&str], creator: &str) {
        let participants: Vec<UserId> = members.iter().map(|m| uid(m)).collect();
        let summary = GroupSummary {
            chat_id: chat_id.clone(),
            group_name: "g".into(),
            created_by: uid(creator),
            seen_status: seed_seen_map(&participants, &uid(creator)),
            participants,
            ..Default::default()
        };
        let mut fields = encode(&summary).unwrap();
        fields.insert("isGroupChat".into(), true.into());
        store
            .set(&DocumentPath::chat(chat_id), fields, SetMode::Overwrite)
            .await
            .unwrap();
    }

    async fn messages(store: &MemoryDocumentStore, chat_id: &ChatId) -> Vec<Message> {
        let docs = store
            .query(&Query::collection(messages_collection(chat_id)))
            .await
            .unwrap();
        docs.iter().map(|d| d.decode().unwrap()).collect()
    }

    async fn group_summary(store: &MemoryDocumentStore, chat_id: &ChatId) -> GroupSummary {
        store
            .get(&DocumentPath::chat(chat_id))
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap()
    }

    #[tokio::test]
    async fn first_direct_message_sets_sender_flag_only() {
        let (store, reconciler) = setup();
        let chat_id = derive_one_to_one_id(&uid("b2"), &uid("a1"));
        reconciler
            .on_message_sent(&chat_id, &uid("a1"), &[uid("a1"), uid("b2")])
            .await
            .unwrap();

        let summary: DirectSummary = store
            .get(&DocumentPath::chat(&chat_id))
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(summary.chat_id.as_str(), "a1_b2");
        assert_eq!(summary.user1_id, uid("a1"));
        assert!(summary.user1_seen);
        assert!(!summary.user2_seen);
    }

    #[tokio::test]
    async fn reconcile_direct_marks_only_the_other_participants_messages() {
        let (store, reconciler) = setup();
        let chat_id = derive_one_to_one_id(&uid("a1"), &uid("b2"));
        put_direct(&store, "a1", "b2", "hi").await;
        put_direct(&store, "b2", "a1", "hey").await;
        let observed = messages(&store, &chat_id).await;

        let marked = reconciler
            .reconcile_direct(&chat_id, &uid("b2"), &observed)
            .await
            .unwrap();
        assert_eq!(marked, 1);

        for m in messages(&store, &chat_id).await {
            assert_eq!(m.seen, m.sender_id == uid("a1"));
        }
    }

    #[tokio::test]
    async fn reconcile_direct_twice_writes_once() {
        let (store, reconciler) = setup();
        let chat_id = derive_one_to_one_id(&uid("a1"), &uid("b2"));
        put_direct(&store, "a1", "b2", "hi").await;

        let observed = messages(&store, &chat_id).await;
        assert_eq!(reconciler.reconcile_direct(&chat_id, &uid("b2"), &observed).await.unwrap(), 1);
        let writes = store.committed_writes();

        let observed = messages(&store, &chat_id).await;
        assert_eq!(reconciler.reconcile_direct(&chat_id, &uid("b2"), &observed).await.unwrap(), 0);
        assert_eq!(store.committed_writes(), writes);
    }

    #[tokio::test]
    async fn failed_batch_leaves_messages_unseen() {
        let (store, reconciler) = setup();
        let chat_id = derive_one_to_one_id(&uid("a1"), &uid("b2"));
        put_direct(&store, "a1", "b2", "one").await;
        put_direct(&store, "a1", "b2", "two").await;
        let observed = messages(&store, &chat_id).await;

        store.set_available(false);
        let err = reconciler
            .reconcile_direct(&chat_id, &uid("b2"), &observed)
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptError::StoreUnavailable(_)));
        store.set_available(true);

        assert!(messages(&store, &chat_id).await.iter().all(|m| !m.seen));
    }

    #[tokio::test]
    async fn opening_direct_chat_without_summary_still_marks_messages() {
        let (store, reconciler) = setup();
        let chat_id = derive_one_to_one_id(&uid("a1"), &uid("b2"));
        put_direct(&store, "a1", "b2", "hi").await;

        let err = reconciler
            .on_conversation_opened(&chat_id, &uid("b2"), ConversationKind::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptError::DocumentMissing(_)));
        assert!(messages(&store, &chat_id).await.iter().all(|m| m.seen));
    }

    #[tokio::test]
    async fn opening_group_sets_only_the_readers_key() {
        let (store, reconciler) = setup();
        let chat_id = ChatId::new("group_1");
        put_group(&store, &chat_id, &["u1", "u2", "u3"], "u1").await;

        let report = reconciler
            .on_conversation_opened(&chat_id, &uid("u2"), ConversationKind::Group)
            .await
            .unwrap();
        assert!(report.summary_marked);

        let summary = group_summary(&store, &chat_id).await;
        assert_eq!(
            summary.seen_status,
            BTreeMap::from([(uid("u1"), true), (uid("u2"), true), (uid("u3"), false)])
        );
    }

    #[tokio::test]
    async fn missing_seen_status_is_seeded_from_participants() {
        let (store, reconciler) = setup();
        let chat_id = ChatId::new("group_2");
        store
            .set(
                &DocumentPath::chat(&chat_id),
                fields! { "isGroupChat" => true, "participants" => ["u1", "u2"] },
                SetMode::Overwrite,
            )
            .await
            .unwrap();

        reconciler
            .on_conversation_opened(&chat_id, &uid("u2"), ConversationKind::Group)
            .await
            .unwrap();
        let summary = group_summary(&store, &chat_id).await;
        assert_eq!(
            summary.seen_status,
            BTreeMap::from([(uid("u1"), false), (uid("u2"), true)])
        );
    }

    #[tokio::test]
    async fn outsiders_are_not_added_to_seen_status() {
        let (store, reconciler) = setup();
        let chat_id = ChatId::new("group_6");
        put_group(&store, &chat_id, &["u1", "u2"], "u1").await;
        let writes = store.committed_writes();

        let report = reconciler
            .on_conversation_opened(&chat_id, &uid("u9"), ConversationKind::Group)
            .await
            .unwrap();
        assert!(!report.summary_marked);
        assert_eq!(store.committed_writes(), writes);

        let summary = group_summary(&store, &chat_id).await;
        assert_eq!(
            summary.seen_status,
            BTreeMap::from([(uid("u1"), true), (uid("u2"), false)])
        );

        let message = Message::new_group(chat_id.clone(), uid("u1"), &summary.participants, "hi");
        store
            .add(&messages_collection(&chat_id), encode(&message).unwrap())
            .await
            .unwrap();
        assert_eq!(reconciler.mark_group_messages_seen(&chat_id, &uid("u9")).await.unwrap(), 0);
        assert!(!messages(&store, &chat_id).await[0].seen_by.contains_key(&uid("u9")));
    }

    #[tokio::test]
    async fn concurrent_group_opens_keep_both_keys() {
        let (store, reconciler) = setup();
        let chat_id = ChatId::new("group_3");
        put_group(&store, &chat_id, &["u1", "u2", "u3"], "u1").await;

        let (u2, u3) = (uid("u2"), uid("u3"));
        let (a, b) = tokio::join!(
            reconciler.on_conversation_opened(&chat_id, &u2, ConversationKind::Group),
            reconciler.on_conversation_opened(&chat_id, &u3, ConversationKind::Group),
        );
        a.unwrap();
        b.unwrap();

        let summary = group_summary(&store, &chat_id).await;
        assert!(summary.seen_status.values().all(|seen| *seen));
    }

    #[tokio::test]
    async fn group_messages_are_marked_once_per_reader() {
        let (store, reconciler) = setup();
        let chat_id = ChatId::new("group_4");
        let participants = [uid("u1"), uid("u2"), uid("u3")];
        for content in ["a", "b"] {
            let message = Message::new_group(chat_id.clone(), uid("u1"), &participants, content);
            store
                .add(&messages_collection(&chat_id), encode(&message).unwrap())
                .await
                .unwrap();
        }

        assert_eq!(reconciler.mark_group_messages_seen(&chat_id, &uid("u2")).await.unwrap(), 2);
        assert_eq!(reconciler.mark_group_messages_seen(&chat_id, &uid("u2")).await.unwrap(), 0);
        assert_eq!(reconciler.mark_group_messages_seen(&chat_id, &uid("u1")).await.unwrap(), 0);

        for m in messages(&store, &chat_id).await {
            assert_eq!(
                m.seen_by,
                BTreeMap::from([(uid("u1"), true), (uid("u2"), true), (uid("u3"), false)])
            );
        }
    }

    #[tokio::test]
    async fn group_message_sent_reseeds_seen_status() {
        let (store, reconciler) = setup();
        let chat_id = ChatId::new("group_5");
        put_group(&store, &chat_id, &["u1", "u2", "u3"], "u1").await;
        reconciler
            .on_conversation_opened(&chat_id, &uid("u2"), ConversationKind::Group)
            .await
            .unwrap();

        reconciler
            .on_message_sent(&chat_id, &uid("u3"), &[uid("u1"), uid("u2"), uid("u3")])
            .await
            .unwrap();
        let summary = group_summary(&store, &chat_id).await;
        assert_eq!(
            summary.seen_status,
            BTreeMap::from([(uid("u1"), false), (uid("u2"), false), (uid("u3"), true)])
        );
    }

    #[tokio::test]
    async fn watch_marks_incoming_direct_messages_until_cancelled() {
        let (store, reconciler) = setup();
        let chat_id = derive_one_to_one_id(&uid("a1"), &uid("b2"));
        reconciler
            .on_message_sent(&chat_id, &uid("a1"), &[uid("a1"), uid("b2")])
            .await
            .unwrap();

        let mut watch = reconciler
            .watch(&chat_id, &uid("b2"), ConversationKind::Direct)
            .await
            .unwrap();
        assert_eq!(watch.next_pass().await, Some(0));

        put_direct(&store, "a1", "b2", "while open").await;
        let marked = tokio::time::timeout(Duration::from_secs(1), watch.next_pass())
            .await
            .unwrap();
        assert_eq!(marked, Some(1));
        assert!(messages(&store, &chat_id).await.iter().all(|m| m.seen));

        watch.cancel();
        assert!(!watch.is_active());
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.listener_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
