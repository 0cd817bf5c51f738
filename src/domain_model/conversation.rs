use crate::domain_model::{Timestamp, UserId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DIRECT_ID_SEPARATOR: char = '_';
pub const GROUP_ID_PREFIX: &str = "group_";

#[derive(Debug, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn new_group() -> Self {
        Self(format!("{}{}", GROUP_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParticipantRole {
    First,
    Second,
}

impl ParticipantRole {
    /// Summary field holding this role's seen flag.
    pub fn seen_field(&self) -> &'static str {
        match self {
            ParticipantRole::First => "user1Seen",
            ParticipantRole::Second => "user2Seen",
        }
    }
}

/// Unordered pair of participants, stored in ascending order.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct UserPair(UserId, UserId);

impl UserPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a < b { Self(a, b) } else { Self(b, a) }
    }

    pub fn first(&self) -> &UserId {
        &self.0
    }

    pub fn second(&self) -> &UserId {
        &self.1
    }

    pub fn role_of(&self, user: &UserId) -> Option<ParticipantRole> {
        if *user == self.0 {
            Some(ParticipantRole::First)
        } else if *user == self.1 {
            Some(ParticipantRole::Second)
        } else {
            None
        }
    }

    pub fn chat_id(&self) -> ChatId {
        ChatId(format!("{}{}{}", self.0, DIRECT_ID_SEPARATOR, self.1))
    }
}

/// Canonical id of the 1:1 conversation between `a` and `b`.
///
/// Ids must not contain the separator in a way that makes two pairs collide;
/// this is not checked.
pub fn derive_one_to_one_id(a: &UserId, b: &UserId) -> ChatId {
    UserPair::new(a.clone(), b.clone()).chat_id()
}

/// Chat list row of a 1:1 conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectSummary {
    pub chat_id: ChatId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub participants: Vec<UserId>,
    pub user1_seen: bool,
    pub user2_seen: bool,
    pub last_message_sender_id: Option<UserId>,
    pub last_message_content: String,
    pub last_message_timestamp: Timestamp,
}

impl DirectSummary {
    pub fn pair(&self) -> UserPair {
        UserPair::new(self.user1_id.clone(), self.user2_id.clone())
    }

    pub fn role_of(&self, user: &UserId) -> Option<ParticipantRole> {
        if *user == self.user1_id {
            Some(ParticipantRole::First)
        } else if *user == self.user2_id {
            Some(ParticipantRole::Second)
        } else {
            None
        }
    }

    pub fn seen_by(&self, user: &UserId) -> Option<bool> {
        self.role_of(user).map(|role| match role {
            ParticipantRole::First => self.user1_seen,
            ParticipantRole::Second => self.user2_seen,
        })
    }
}

/// Chat list row of a group conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSummary {
    pub chat_id: ChatId,
    pub group_name: String,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub participants: Vec<UserId>,
    pub seen_status: BTreeMap<UserId, bool>,
    pub last_message_sender_id: Option<UserId>,
    pub last_message_content: String,
    pub last_message_timestamp: Timestamp,
}

impl GroupSummary {
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Current `seenStatus`, rebuilt from `participants` when the map was never written.
    pub fn seen_status_or_seeded(&self, reader: &UserId) -> BTreeMap<UserId, bool> {
        if !self.seen_status.is_empty() {
            return self.seen_status.clone();
        }
        seed_seen_map(&self.participants, reader)
    }
}

/// `{p: p == author}` over `participants`.
pub fn seed_seen_map(participants: &[UserId], author: &UserId) -> BTreeMap<UserId, bool> {
    participants
        .iter()
        .map(|p| (p.clone(), p == author))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationSummary {
    Direct(DirectSummary),
    Group(GroupSummary),
}

impl ConversationSummary {
    pub fn kind(&self) -> ConversationKind {
        match self {
            ConversationSummary::Direct(_) => ConversationKind::Direct,
            ConversationSummary::Group(_) => ConversationKind::Group,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        match self {
            ConversationSummary::Direct(s) => &s.chat_id,
            ConversationSummary::Group(s) => &s.chat_id,
        }
    }

    pub fn last_message_sender_id(&self) -> Option<&UserId> {
        match self {
            ConversationSummary::Direct(s) => s.last_message_sender_id.as_ref(),
            ConversationSummary::Group(s) => s.last_message_sender_id.as_ref(),
        }
    }

    pub fn last_message_content(&self) -> &str {
        match self {
            ConversationSummary::Direct(s) => &s.last_message_content,
            ConversationSummary::Group(s) => &s.last_message_content,
        }
    }

    pub fn last_message_timestamp(&self) -> Timestamp {
        match self {
            ConversationSummary::Direct(s) => s.last_message_timestamp,
            ConversationSummary::Group(s) => s.last_message_timestamp,
        }
    }

    /// Unread unless the user's flag is explicitly `true`.
    pub fn is_unread_for(&self, user: &UserId) -> bool {
        match self {
            ConversationSummary::Direct(s) => !s.seen_by(user).unwrap_or(false),
            ConversationSummary::Group(s) => !s.seen_status.get(user).copied().unwrap_or(false),
        }
    }
}

impl<'de> Deserialize<'de> for ConversationSummary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let is_group = value
            .get("isGroupChat")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if is_group {
            GroupSummary::deserialize(value)
                .map(ConversationSummary::Group)
                .map_err(D::Error::custom)
        } else {
            DirectSummary::deserialize(value)
                .map(ConversationSummary::Direct)
                .map_err(D::Error::custom)
        }
    }
}
