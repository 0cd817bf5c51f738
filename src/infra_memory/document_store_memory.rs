use crate::domain_port::*;
use nanoid::nanoid;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, UnboundedSender};

struct StoredDocument {
    fields: Fields,
    version: u64,
}

struct Listener {
    query: Query,
    known: HashSet<DocumentPath>,
    events: UnboundedSender<Result<ChangeSet, StoreError>>,
}

#[derive(Default)]
struct StoreState {
    docs: BTreeMap<DocumentPath, StoredDocument>,
    listeners: HashMap<u64, Listener>,
}

impl StoreState {
    fn snapshot(&self, path: &DocumentPath) -> Option<Document> {
        self.docs.get(path).map(|d| Document {
            path: path.clone(),
            fields: d.fields.clone(),
            version: d.version,
        })
    }

    fn check(&self, path: &DocumentPath, precondition: Precondition) -> Result<(), StoreError> {
        let doc = self
            .docs
            .get(path)
            .ok_or_else(|| StoreError::DocumentMissing(path.to_string()))?;
        match precondition {
            Precondition::Version(expected) if expected != doc.version => {
                Err(StoreError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    found: doc.version,
                })
            }
            _ => Ok(()),
        }
    }

    fn write(&mut self, path: &DocumentPath, fields: Fields, mode: SetMode) {
        match self.docs.get_mut(path) {
            Some(doc) => {
                match mode {
                    SetMode::Merge => doc.fields.extend(fields),
                    SetMode::Overwrite => doc.fields = fields,
                }
                doc.version += 1;
            }
            None => {
                self.docs
                    .insert(path.clone(), StoredDocument { fields, version: 1 });
            }
        }
    }

    /// Pushes one change set per interested listener. `before` holds the
    /// state of every touched document prior to the write.
    fn notify(&mut self, before: Vec<(DocumentPath, Option<Document>)>) {
        let mut closed = Vec::new();
        let docs = &self.docs;
        for (id, listener) in self.listeners.iter_mut() {
            let mut changes = ChangeSet::default();
            for (path, previous) in &before {
                if path.collection != listener.query.collection {
                    continue;
                }
                let current = docs.get(path).map(|d| Document {
                    path: path.clone(),
                    fields: d.fields.clone(),
                    version: d.version,
                });
                let matches_now = current.as_ref().is_some_and(|d| listener.query.matches(d));
                let was_known = listener.known.contains(path);
                match (matches_now, was_known, current) {
                    (true, false, Some(doc)) => {
                        listener.known.insert(path.clone());
                        changes.added.push(doc);
                    }
                    (true, true, Some(doc)) => changes.modified.push(doc),
                    (false, true, current) => {
                        listener.known.remove(path);
                        if let Some(doc) = current.or_else(|| previous.clone()) {
                            changes.removed.push(doc);
                        }
                    }
                    _ => {}
                }
            }
            if !changes.is_empty() && listener.events.send(Ok(changes)).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

enum BatchOp {
    Update {
        path: DocumentPath,
        fields: Fields,
        precondition: Precondition,
    },
    Delete {
        path: DocumentPath,
    },
}

/// Document store kept in process memory. Atomic batches, versioned
/// documents and change feeds behave like the managed store the core is
/// written against; `set_available(false)` makes every call fail.
pub struct MemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
    available: AtomicBool,
    next_listener_id: AtomicU64,
    committed_writes: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            available: AtomicBool::new(true),
            next_listener_id: AtomicU64::new(1),
            committed_writes: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of document writes and deletes applied so far.
    pub fn committed_writes(&self) -> u64 {
        self.committed_writes.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().map(|s| s.listeners.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn count_writes(&self, n: usize) {
        self.committed_writes.fetch_add(n as u64, Ordering::SeqCst);
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryListenerRegistration {
    state: Weak<Mutex<StoreState>>,
    id: u64,
}

impl ListenerRegistration for MemoryListenerRegistration {
    fn remove(&self) {
        if let Some(state) = self.state.upgrade() {
            if let Ok(mut state) = state.lock() {
                state.listeners.remove(&self.id);
            }
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        let state = self.lock()?;
        Ok(state.snapshot(path))
    }

    async fn set(&self, path: &DocumentPath, fields: Fields, mode: SetMode) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let before = vec![(path.clone(), state.snapshot(path))];
        state.write(path, fields, mode);
        state.notify(before);
        self.count_writes(1);
        Ok(())
    }

    async fn update(
        &self,
        path: &DocumentPath,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.check(path, precondition)?;
        let before = vec![(path.clone(), state.snapshot(path))];
        state.write(path, fields, SetMode::Merge);
        state.notify(before);
        self.count_writes(1);
        Ok(())
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<DocumentPath, StoreError> {
        let path = DocumentPath::new(collection, nanoid!(20));
        self.set(&path, fields, SetMode::Overwrite).await?;
        Ok(path)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let state = self.lock()?;
        let docs = state
            .docs
            .keys()
            .filter_map(|path| state.snapshot(path))
            .filter(|doc| query.matches(doc))
            .collect();
        Ok(docs)
    }

    fn batch(&self) -> Box<dyn WriteBatch + '_> {
        Box::new(MemoryWriteBatch {
            store: self,
            ops: Vec::new(),
        })
    }

    async fn subscribe(&self, query: Query) -> Result<ChangeFeed, StoreError> {
        let mut state = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let initial: Vec<Document> = state
            .docs
            .keys()
            .filter_map(|path| state.snapshot(path))
            .filter(|doc| query.matches(doc))
            .collect();
        let known = initial.iter().map(|d| d.path.clone()).collect();
        let _ = tx.send(Ok(ChangeSet {
            added: initial,
            ..Default::default()
        }));

        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(listener = id, collection = %query.collection, "listener registered");
        state.listeners.insert(
            id,
            Listener {
                query,
                known,
                events: tx,
            },
        );

        let registration = MemoryListenerRegistration {
            state: Arc::downgrade(&self.state),
            id,
        };
        Ok(Subscription::new(rx, Box::new(registration)))
    }
}

pub struct MemoryWriteBatch<'s> {
    store: &'s MemoryDocumentStore,
    ops: Vec<BatchOp>,
}

#[async_trait::async_trait]
impl<'s> WriteBatch for MemoryWriteBatch<'s> {
    fn update(&mut self, path: DocumentPath, fields: Fields, precondition: Precondition) {
        self.ops.push(BatchOp::Update {
            path,
            fields,
            precondition,
        });
    }

    fn delete(&mut self, path: DocumentPath) {
        self.ops.push(BatchOp::Delete { path });
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryWriteBatch { store, ops } = *self;
        let mut state = store.lock()?;

        // validate everything before touching anything
        for op in &ops {
            if let BatchOp::Update {
                path, precondition, ..
            } = op
            {
                state.check(path, *precondition)?;
            }
        }

        let mut before = Vec::with_capacity(ops.len());
        let applied = ops.len();
        for op in ops {
            match op {
                BatchOp::Update { path, fields, .. } => {
                    before.push((path.clone(), state.snapshot(&path)));
                    state.write(&path, fields, SetMode::Merge);
                }
                BatchOp::Delete { path } => {
                    before.push((path.clone(), state.snapshot(&path)));
                    state.docs.remove(&path);
                }
            }
        }
        state.notify(before);
        store.count_writes(applied);
        Ok(())
    }
}
