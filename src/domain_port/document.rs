use crate::domain_model::*;
use crate::domain_port::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

pub type Fields = serde_json::Map<String, Value>;

pub const USERS: &str = "users";
pub const CHATS: &str = "chats";

pub fn messages_collection(chat_id: &ChatId) -> String {
    format!("{}/{}/messages", CHATS, chat_id)
}

#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DocumentPath {
    pub collection: String,
    pub id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn user(user_id: &UserId) -> Self {
        Self::new(USERS, user_id.as_str())
    }

    pub fn chat(chat_id: &ChatId) -> Self {
        Self::new(CHATS, chat_id.as_str())
    }

    pub fn message(chat_id: &ChatId, message_id: &MessageId) -> Self {
        Self::new(messages_collection(chat_id), message_id.0.as_str())
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocumentPath,
    pub fields: Fields,
    /// Bumped by the store on every write; used for conditional updates.
    pub version: u64,
}

impl Document {
    pub fn id(&self) -> &str {
        &self.path.id
    }

    /// Typed view of the document. The document id fills `T::ID_FIELD` when the
    /// field itself is absent; every other missing field takes its serde default.
    pub fn decode<T: Record>(&self) -> Result<T, StoreError> {
        let mut fields = self.fields.clone();
        fields
            .entry(T::ID_FIELD)
            .or_insert_with(|| Value::String(self.path.id.clone()));
        serde_json::from_value(Value::Object(fields)).map_err(|e| StoreError::Decode {
            path: self.path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A document shape the core reads back from the store.
pub trait Record: DeserializeOwned {
    const ID_FIELD: &'static str;
}

impl Record for UserPresence {
    const ID_FIELD: &'static str = "userId";
}

impl Record for Message {
    const ID_FIELD: &'static str = "messageId";
}

impl Record for ConversationSummary {
    const ID_FIELD: &'static str = "chatId";
}

impl Record for DirectSummary {
    const ID_FIELD: &'static str = "chatId";
}

impl Record for GroupSummary {
    const ID_FIELD: &'static str = "chatId";
}

pub fn encode<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StoreError::Encode(format!("expected an object, got {other}"))),
        Err(e) => Err(StoreError::Encode(e.to_string())),
    }
}

/// Builds a field bag from `(name, value)` pairs.
#[macro_export]
macro_rules! fields {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::domain_port::Fields::new();
        $( map.insert(String::from($name), serde_json::json!($value)); )*
        map
    }};
}
