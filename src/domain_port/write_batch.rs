use crate::domain_port::{DocumentPath, Fields, Precondition, StoreError};

/// Atomic multi-document write. Either every queued operation is applied on
/// `commit` or none is.
#[async_trait::async_trait]
pub trait WriteBatch: Send {
    fn update(&mut self, path: DocumentPath, fields: Fields, precondition: Precondition);

    fn delete(&mut self, path: DocumentPath);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
