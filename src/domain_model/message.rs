use crate::domain_model::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    #[serde(skip_serializing)]
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: Timestamp,
    pub is_system_message: bool,
    /// 1:1 read receipt.
    pub seen: bool,
    /// Group read receipts, one entry per participant.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub seen_by: BTreeMap<UserId, bool>,
}

impl Message {
    pub fn new_direct(chat_id: ChatId, sender: UserId, receiver: UserId, content: &str) -> Self {
        Self {
            message_id: MessageId::default(),
            chat_id,
            sender_id: sender,
            receiver_id: receiver.0,
            content: content.to_owned(),
            timestamp: Timestamp::now(),
            is_system_message: false,
            seen: false,
            seen_by: BTreeMap::new(),
        }
    }

    /// Group message with `seenBy` seeded: sender seen, everyone else unseen.
    pub fn new_group(chat_id: ChatId, sender: UserId, participants: &[UserId], content: &str) -> Self {
        let mut seen_by = seed_seen_map(participants, &sender);
        seen_by.insert(sender.clone(), true);
        Self {
            message_id: MessageId::default(),
            chat_id,
            sender_id: sender,
            receiver_id: String::new(),
            content: content.to_owned(),
            timestamp: Timestamp::now(),
            is_system_message: false,
            seen: false,
            seen_by,
        }
    }

    /// System notice in a group; `author` is treated as having seen it.
    pub fn new_system(chat_id: ChatId, participants: &[UserId], author: &UserId, content: &str) -> Self {
        Self {
            message_id: MessageId::default(),
            chat_id,
            sender_id: UserId::from(SYSTEM_SENDER),
            receiver_id: String::new(),
            content: content.to_owned(),
            timestamp: Timestamp::now(),
            is_system_message: true,
            seen: false,
            seen_by: seed_seen_map(participants, author),
        }
    }

    pub fn is_seen_by(&self, reader: &UserId) -> bool {
        self.seen_by.get(reader).copied().unwrap_or(false)
    }

    /// Whether `reader` still has to flip this 1:1 message to seen.
    pub fn awaits_direct_receipt(&self, reader: &UserId) -> bool {
        !self.seen && !self.is_system_message && self.sender_id != *reader
    }

    /// `seenBy` with `reader` set, or `None` when already marked or when the
    /// reader was not a participant at send time.
    pub fn seen_by_with(&self, reader: &UserId) -> Option<BTreeMap<UserId, bool>> {
        if !self.seen_by.contains_key(reader) || self.is_seen_by(reader) {
            return None;
        }
        let mut map = self.seen_by.clone();
        map.insert(reader.clone(), true);
        Some(map)
    }
}
