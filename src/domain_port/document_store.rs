use crate::domain_port::*;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("document missing: {0}")]
    DocumentMissing(String),
    #[error("version conflict on {path}: expected {expected}, found {found}")]
    VersionConflict {
        path: String,
        expected: u64,
        found: u64,
    },
    #[error("cannot decode {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("cannot encode fields: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SetMode {
    /// Top-level fields are merged into the existing document, creating it if absent.
    Merge,
    /// The document is replaced.
    Overwrite,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Precondition {
    None,
    /// Write only if the stored version still equals this one.
    Version(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    ArrayContains(String, Value),
}

impl Filter {
    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::Eq(name, value) => fields.get(name) == Some(value),
            Filter::ArrayContains(name, value) => fields
                .get(name)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_owned(), value.into()));
        self
    }

    pub fn where_array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::ArrayContains(field.to_owned(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.path.collection == self.collection && self.filters.iter().all(|f| f.matches(&doc.fields))
    }
}

/// One delivery of a query subscription. The first delivery lists every
/// matching document under `added`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<Document>,
    pub modified: Vec<Document>,
    pub removed: Vec<Document>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Added and modified documents, in that order.
    pub fn upserted(&self) -> impl Iterator<Item = &Document> {
        self.added.iter().chain(self.modified.iter())
    }
}

pub type ChangeFeed = Subscription<Result<ChangeSet, StoreError>>;

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError>;

    async fn set(&self, path: &DocumentPath, fields: Fields, mode: SetMode) -> Result<(), StoreError>;

    /// Partial update. Fails with `DocumentMissing` if the document does not exist.
    async fn update(
        &self,
        path: &DocumentPath,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<(), StoreError>;

    /// Creates a document with a generated id.
    async fn add(&self, collection: &str, fields: Fields) -> Result<DocumentPath, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    fn batch(&self) -> Box<dyn WriteBatch + '_>;

    /// Initial snapshot followed by incremental change sets until the
    /// subscription is cancelled or dropped.
    async fn subscribe(&self, query: Query) -> Result<ChangeFeed, StoreError>;
}
