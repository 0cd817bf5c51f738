use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::fields;
use std::sync::Arc;

const DEFAULT_USERNAME: &str = "User";

pub struct RealConversationService {
    store: Arc<dyn DocumentStore>,
    receipts: Arc<dyn ReadReceiptService>,
}

impl RealConversationService {
    pub fn new(store: Arc<dyn DocumentStore>, receipts: Arc<dyn ReadReceiptService>) -> Self {
        Self { store, receipts }
    }

    async fn append(&self, mut message: Message) -> Result<Message, ChatError> {
        let fields = encode(&message)?;
        let path = self
            .store
            .add(&messages_collection(&message.chat_id), fields)
            .await?;
        message.message_id = MessageId(path.id);
        Ok(message)
    }

    async fn load_group(&self, chat_id: &ChatId) -> Result<GroupSummary, ChatError> {
        let path = DocumentPath::chat(chat_id);
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| ChatError::DocumentMissing(path.to_string()))?;
        match doc.decode::<ConversationSummary>()? {
            ConversationSummary::Group(group) => Ok(group),
            ConversationSummary::Direct(_) => Err(ChatError::NotGroup(chat_id.clone())),
        }
    }
}

/// `username` from the user's profile document, `"User"` when unknown.
pub async fn resolve_username(store: &dyn DocumentStore, user: &UserId) -> String {
    match store.get(&DocumentPath::user(user)).await {
        Ok(Some(doc)) => doc
            .fields
            .get("username")
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_USERNAME)
            .to_owned(),
        Ok(None) => DEFAULT_USERNAME.to_owned(),
        Err(e) => {
            tracing::warn!(%user, error = %e, "cannot look up username");
            DEFAULT_USERNAME.to_owned()
        }
    }
}

/// Members followed by the creator, first occurrence kept, blanks dropped.
fn group_participants(creator: &UserId, members: &[UserId]) -> Vec<UserId> {
    let mut participants: Vec<UserId> = Vec::with_capacity(members.len() + 1);
    for user in members.iter().chain(std::iter::once(creator)) {
        if !user.as_str().is_empty() && !participants.contains(user) {
            participants.push(user.clone());
        }
    }
    participants
}

#[async_trait::async_trait]
impl ConversationService for RealConversationService {
    async fn send_direct_message(
        &self,
        sender: &UserId,
        recipient: &UserId,
        content: &str,
    ) -> Result<Message, ChatError> {
        let chat_id = derive_one_to_one_id(sender, recipient);
        let message = self
            .append(Message::new_direct(
                chat_id.clone(),
                sender.clone(),
                recipient.clone(),
                content,
            ))
            .await?;

        let last_message = fields! {
            "chatId" => chat_id,
            "lastMessageContent" => content,
            "lastMessageTimestamp" => message.timestamp,
            "lastMessageSenderId" => sender,
        };
        self.receipts
            .record_message_sent(
                &chat_id,
                sender,
                &[sender.clone(), recipient.clone()],
                last_message,
            )
            .await?;

        tracing::debug!(%chat_id, message_id = %message.message_id, "direct message sent");
        Ok(message)
    }

    async fn send_group_message(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        content: &str,
    ) -> Result<Message, ChatError> {
        let group = self.load_group(chat_id).await?;
        if !group.is_participant(sender) {
            tracing::trace!(%chat_id, %sender, "membership check failed when sending message");
            return Err(ChatError::NotMember);
        }

        let message = self
            .append(Message::new_group(
                chat_id.clone(),
                sender.clone(),
                &group.participants,
                content,
            ))
            .await?;

        let username = resolve_username(self.store.as_ref(), sender).await;
        let last_message = fields! {
            "lastMessageContent" => format!("{username}: {content}"),
            "lastMessageTimestamp" => message.timestamp,
            "lastMessageSenderId" => sender,
        };
        self.receipts
            .record_message_sent(chat_id, sender, &group.participants, last_message)
            .await?;

        tracing::debug!(%chat_id, message_id = %message.message_id, "group message sent");
        Ok(message)
    }

    async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<GroupSummary, ChatError> {
        let participants = group_participants(creator, members);
        if participants.len() < 2 {
            return Err(ChatError::InvalidParticipants);
        }

        let chat_id = ChatId::new_group();
        let created_at = Timestamp::now();
        let summary = GroupSummary {
            chat_id: chat_id.clone(),
            group_name: name.to_owned(),
            created_by: creator.clone(),
            created_at,
            seen_status: seed_seen_map(&participants, creator),
            participants,
            last_message_sender_id: None,
            last_message_content: String::new(),
            last_message_timestamp: created_at,
        };

        let mut fields = encode(&summary)?;
        fields.insert("isGroupChat".to_owned(), true.into());
        self.store
            .set(&DocumentPath::chat(&chat_id), fields, SetMode::Overwrite)
            .await?;

        let creator_name = resolve_username(self.store.as_ref(), creator).await;
        let notice = Message::new_system(
            chat_id.clone(),
            &summary.participants,
            creator,
            &format!("{creator_name} created the group"),
        );
        if let Err(e) = self.append(notice).await {
            tracing::warn!(%chat_id, error = %e, "cannot append group creation notice");
        }

        tracing::info!(%chat_id, members = summary.participants.len(), "group created");
        Ok(summary)
    }

    async fn delete_group(&self, chat_id: &ChatId) -> Result<(), ChatError> {
        let summary_path = DocumentPath::chat(chat_id);
        match self.store.get(&summary_path).await? {
            Some(doc) => {
                if let ConversationSummary::Direct(_) = doc.decode::<ConversationSummary>()? {
                    return Err(ChatError::NotGroup(chat_id.clone()));
                }
            }
            None if !chat_id.as_str().starts_with(GROUP_ID_PREFIX) => {
                return Err(ChatError::NotGroup(chat_id.clone()));
            }
            None => {}
        }

        let messages = self
            .store
            .query(&Query::collection(messages_collection(chat_id)))
            .await?;
        let mut batch = self.store.batch();
        for doc in messages {
            batch.delete(doc.path);
        }
        let deleted = batch.len();
        if !batch.is_empty() {
            batch.commit().await?;
        }

        let mut batch = self.store.batch();
        batch.delete(summary_path);
        if let Err(e) = batch.commit().await {
            tracing::error!(%chat_id, error = %e, "messages deleted but summary left behind");
            return Err(e.into());
        }

        tracing::info!(%chat_id, deleted, "group deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::RealReadReceiptReconciler;
    use crate::infra_memory::MemoryDocumentStore;
    use std::collections::BTreeMap;

    fn uid(s: &str) -> UserId {
        UserId::from(s)
    }

    fn setup() -> (Arc<MemoryDocumentStore>, RealConversationService) {
        let store = Arc::new(MemoryDocumentStore::new());
        let receipts = Arc::new(RealReadReceiptReconciler::new(store.clone(), 5));
        (store.clone(), RealConversationService::new(store, receipts))
    }

    async fn summary(store: &MemoryDocumentStore, chat_id: &ChatId) -> Option<ConversationSummary> {
        store
            .get(&DocumentPath::chat(chat_id))
            .await
            .unwrap()
            .map(|doc| doc.decode().unwrap())
    }

    async fn message_docs(store: &MemoryDocumentStore, chat_id: &ChatId) -> Vec<Message> {
        store
            .query(&Query::collection(messages_collection(chat_id)))
            .await
            .unwrap()
            .iter()
            .map(|d| d.decode().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn direct_message_creates_summary_with_seen_flags() {
        let (store, service) = setup();
        let message = service
            .send_direct_message(&uid("a1"), &uid("b2"), "hello")
            .await
            .unwrap();
        assert!(!message.seen);
        assert!(!message.message_id.0.is_empty());

        let Some(ConversationSummary::Direct(s)) = summary(&store, &ChatId::new("a1_b2")).await else {
            panic!("expected a direct summary");
        };
        assert!(s.user1_seen);
        assert!(!s.user2_seen);
        assert_eq!(s.last_message_content, "hello");
        assert_eq!(s.last_message_sender_id, Some(uid("a1")));
        assert_eq!(s.participants, vec![uid("a1"), uid("b2")]);
    }

    #[tokio::test]
    async fn reply_flips_the_flags() {
        let (store, service) = setup();
        service.send_direct_message(&uid("a1"), &uid("b2"), "hi").await.unwrap();
        service.send_direct_message(&uid("b2"), &uid("a1"), "yo").await.unwrap();

        let Some(ConversationSummary::Direct(s)) = summary(&store, &ChatId::new("a1_b2")).await else {
            panic!("expected a direct summary");
        };
        assert!(!s.user1_seen);
        assert!(s.user2_seen);
    }

    fn published(feed: &mut ChangeFeed) -> Vec<ConversationSummary> {
        let mut summaries = Vec::new();
        while let Some(changes) = feed.try_next() {
            for doc in changes.unwrap().upserted() {
                summaries.push(doc.decode().unwrap());
            }
        }
        summaries
    }

    #[tokio::test]
    async fn listeners_never_see_the_senders_flag_cleared() {
        let (store, service) = setup();
        service.send_direct_message(&uid("b2"), &uid("a1"), "hi").await.unwrap();
        let mut feed = store.subscribe(Query::collection(CHATS)).await.unwrap();
        published(&mut feed);

        service.send_direct_message(&uid("a1"), &uid("b2"), "reply").await.unwrap();
        let summaries = published(&mut feed);
        assert_eq!(summaries.len(), 1);
        let ConversationSummary::Direct(s) = &summaries[0] else {
            panic!("expected a direct summary");
        };
        assert_eq!(s.last_message_sender_id, Some(uid("a1")));
        assert_eq!(s.last_message_content, "reply");
        assert!(s.user1_seen);
        assert!(!s.user2_seen);
    }

    #[tokio::test]
    async fn group_send_publishes_one_summary_with_reseeded_status() {
        let (store, service) = setup();
        let group = service
            .create_group(&uid("u1"), "trip", &[uid("u2"), uid("u3")])
            .await
            .unwrap();
        let mut feed = store.subscribe(Query::collection(CHATS)).await.unwrap();
        published(&mut feed);

        service
            .send_group_message(&group.chat_id, &uid("u3"), "hello")
            .await
            .unwrap();
        let summaries = published(&mut feed);
        assert_eq!(summaries.len(), 1);
        let ConversationSummary::Group(s) = &summaries[0] else {
            panic!("expected a group summary");
        };
        assert_eq!(s.last_message_sender_id, Some(uid("u3")));
        assert_eq!(
            s.seen_status,
            BTreeMap::from([(uid("u1"), false), (uid("u2"), false), (uid("u3"), true)])
        );
    }

    #[tokio::test]
    async fn group_creation_seeds_seen_state_and_notice() {
        let (store, service) = setup();
        store
            .set(
                &DocumentPath::user(&uid("u1")),
                fields! { "username" => "ann" },
                SetMode::Merge,
            )
            .await
            .unwrap();

        let group = service
            .create_group(&uid("u1"), "trip", &[uid("u2"), uid("u3"), uid("u2")])
            .await
            .unwrap();
        assert!(group.chat_id.as_str().starts_with(GROUP_ID_PREFIX));
        assert_eq!(group.participants, vec![uid("u2"), uid("u3"), uid("u1")]);

        let Some(ConversationSummary::Group(stored)) = summary(&store, &group.chat_id).await else {
            panic!("expected a group summary");
        };
        assert_eq!(
            stored.seen_status,
            BTreeMap::from([(uid("u1"), true), (uid("u2"), false), (uid("u3"), false)])
        );

        let notices = message_docs(&store, &group.chat_id).await;
        assert_eq!(notices.len(), 1);
        assert!(notices[0].is_system_message);
        assert_eq!(notices[0].sender_id, uid(SYSTEM_SENDER));
        assert_eq!(notices[0].content, "ann created the group");
        assert_eq!(notices[0].seen_by, stored.seen_status);
    }

    #[tokio::test]
    async fn group_needs_two_participants() {
        let (_, service) = setup();
        let err = service
            .create_group(&uid("u1"), "solo", &[uid("u1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants));
    }

    #[tokio::test]
    async fn group_message_prefixes_username_and_reseeds() {
        let (store, service) = setup();
        let group = service
            .create_group(&uid("u1"), "trip", &[uid("u2"), uid("u3")])
            .await
            .unwrap();

        let message = service
            .send_group_message(&group.chat_id, &uid("u2"), "on my way")
            .await
            .unwrap();
        assert_eq!(
            message.seen_by,
            BTreeMap::from([(uid("u1"), false), (uid("u2"), true), (uid("u3"), false)])
        );

        let Some(ConversationSummary::Group(stored)) = summary(&store, &group.chat_id).await else {
            panic!("expected a group summary");
        };
        assert_eq!(stored.last_message_content, "User: on my way");
        assert_eq!(stored.seen_status, message.seen_by);
    }

    #[tokio::test]
    async fn outsiders_cannot_post_to_groups() {
        let (_, service) = setup();
        let group = service
            .create_group(&uid("u1"), "trip", &[uid("u2")])
            .await
            .unwrap();
        let err = service
            .send_group_message(&group.chat_id, &uid("u9"), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotMember));
    }

    #[tokio::test]
    async fn deleting_a_group_removes_messages_then_summary() {
        let (store, service) = setup();
        let group = service
            .create_group(&uid("u1"), "trip", &[uid("u2")])
            .await
            .unwrap();
        service
            .send_group_message(&group.chat_id, &uid("u2"), "bye")
            .await
            .unwrap();

        service.delete_group(&group.chat_id).await.unwrap();
        assert!(message_docs(&store, &group.chat_id).await.is_empty());
        assert!(summary(&store, &group.chat_id).await.is_none());
    }

    #[tokio::test]
    async fn direct_chats_cannot_be_deleted_as_groups() {
        let (store, service) = setup();
        service.send_direct_message(&uid("a1"), &uid("b2"), "hi").await.unwrap();
        let chat_id = ChatId::new("a1_b2");

        let err = service.delete_group(&chat_id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotGroup(_)));
        assert_eq!(message_docs(&store, &chat_id).await.len(), 1);
    }
}
