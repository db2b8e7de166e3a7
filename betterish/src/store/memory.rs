//! In-process document store for testing and demo mode.
//!
//! Keeps collections in a [`parking_lot::Mutex`] and fans changes out to
//! subscribers over unbounded channels. Tests can script failures with
//! [`MemoryStore::fail_next`], slow every call down with
//! [`MemoryStore::set_latency`], hold query results back with
//! [`MemoryStore::set_reply_delay`], and inspect the order writes arrived in with
//! [`MemoryStore::writes`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use betterish_proto::document::{
    ChangeBatch, Document, Fields, Filter, Query, change_for, merge_patch,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{DocumentStore, StoreError, Subscription};

/// Which store call a scripted fault or write record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Create,
    Update,
    Delete,
    Query,
    Subscribe,
}

/// One mutation as the store received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// The call that performed the write.
    pub call: StoreCall,
    /// Target collection.
    pub collection: String,
    /// Document ID (assigned ID for creates).
    pub id: String,
    /// Fields written (the patch for updates, empty for deletes).
    pub fields: Fields,
}

struct MemorySubscriber {
    collection: String,
    filters: Vec<Filter>,
    sink: mpsc::UnboundedSender<ChangeBatch>,
}

struct Inner {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    subscribers: HashMap<u64, MemorySubscriber>,
    next_subscriber: u64,
    id_prefix: String,
    next_id: u64,
    faults: VecDeque<(StoreCall, StoreError)>,
    writes: Vec<WriteRecord>,
    owner: Option<String>,
    latency: Option<Duration>,
    reply_delay: Option<Duration>,
}

impl Inner {
    fn take_fault(&mut self, call: StoreCall) -> Option<StoreError> {
        let pos = self.faults.iter().position(|(c, _)| *c == call)?;
        self.faults.remove(pos).map(|(_, err)| err)
    }

    fn notify(&mut self, collection: &str, id: &str, before: Option<&Fields>, after: Option<&Fields>) {
        self.subscribers.retain(|_, sub| {
            if sub.collection != collection {
                return true;
            }
            match change_for(id, before, after, &sub.filters) {
                Some(change) => sub
                    .sink
                    .send(ChangeBatch {
                        changes: vec![change],
                    })
                    .is_ok(),
                None => !sub.sink.is_closed(),
            }
        });
    }
}

/// In-memory [`DocumentStore`].
///
/// Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store assigning IDs `doc_1`, `doc_2`, ...
    #[must_use]
    pub fn new() -> Self {
        Self::with_ids("doc_", 1)
    }

    /// Creates an empty store assigning IDs `{prefix}{start}`,
    /// `{prefix}{start + 1}`, ...
    #[must_use]
    pub fn with_ids(prefix: &str, start: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                collections: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 1,
                id_prefix: prefix.to_string(),
                next_id: start,
                faults: VecDeque::new(),
                writes: Vec::new(),
                owner: None,
                latency: None,
                reply_delay: None,
            })),
        }
    }

    /// Makes the next `call` fail with `error` instead of executing.
    ///
    /// Faults queue up: scripting the same call twice fails it twice.
    pub fn fail_next(&self, call: StoreCall, error: StoreError) {
        self.inner.lock().faults.push_back((call, error));
    }

    /// Delays every call by `latency` before it executes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// Delays query results by `delay` after the documents are read, so
    /// writes landing meanwhile are missing from the reply.
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.inner.lock().reply_delay = delay;
    }

    /// Inserts a document under a chosen ID, notifying subscribers.
    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        let mut inner = self.inner.lock();
        let before = inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields.clone());
        inner.notify(collection, id, before.as_ref(), Some(&fields));
    }

    /// Returns a copy of one document's fields.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Fields> {
        let inner = self.inner.lock();
        inner.collections.get(collection)?.get(id).cloned()
    }

    /// Returns every write received so far, in arrival order.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().writes.clone()
    }

    /// Returns the owner last passed to `authenticate`.
    #[must_use]
    pub fn owner(&self) -> Option<String> {
        self.inner.lock().owner.clone()
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|_, s| !s.sink.is_closed());
        inner.subscribers.len()
    }

    /// Applies the configured latency, then consumes a scripted fault.
    async fn enter(&self, call: StoreCall) -> Result<(), StoreError> {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.inner.lock().take_fault(call) {
            Some(err) => {
                tracing::debug!(?call, error = %err, "injected store fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl DocumentStore for MemoryStore {
    async fn authenticate(&self, owner: &str) -> Result<(), StoreError> {
        self.inner.lock().owner = Some(owner.to_string());
        Ok(())
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        self.enter(StoreCall::Create).await?;
        let mut inner = self.inner.lock();
        let id = format!("{}{}", inner.id_prefix, inner.next_id);
        inner.next_id += 1;
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields.clone());
        inner.writes.push(WriteRecord {
            call: StoreCall::Create,
            collection: collection.to_string(),
            id: id.clone(),
            fields: fields.clone(),
        });
        inner.notify(collection, &id, None, Some(&fields));
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<(), StoreError> {
        self.enter(StoreCall::Update).await?;
        let mut inner = self.inner.lock();
        let Some(fields) = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let before = fields.clone();
        merge_patch(fields, &patch);
        let after = fields.clone();
        inner.writes.push(WriteRecord {
            call: StoreCall::Update,
            collection: collection.to_string(),
            id: id.to_string(),
            fields: patch,
        });
        inner.notify(collection, id, Some(&before), Some(&after));
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.enter(StoreCall::Delete).await?;
        let mut inner = self.inner.lock();
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        inner.writes.push(WriteRecord {
            call: StoreCall::Delete,
            collection: collection.to_string(),
            id: id.to_string(),
            fields: Fields::new(),
        });
        if let Some(before) = removed {
            inner.notify(collection, id, Some(&before), None);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.enter(StoreCall::Query).await?;
        let (documents, delay) = {
            let inner = self.inner.lock();
            let documents: Vec<Document> = inner
                .collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                        .collect()
                })
                .unwrap_or_default();
            (documents, inner.reply_delay)
        };
        let selected = query.select(&documents);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(selected)
    }

    async fn subscribe(&self, collection: &str, filters: Vec<Filter>) -> Result<Subscription, StoreError> {
        self.enter(StoreCall::Subscribe).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(
                id,
                MemorySubscriber {
                    collection: collection.to_string(),
                    filters,
                    sink: tx,
                },
            );
            id
        };
        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.lock().subscribers.remove(&id);
            }
        }))
    }
}
