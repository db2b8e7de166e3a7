//! In-memory document database with live change feeds.
//!
//! The [`DocumentDb`] holds named collections of documents and a registry of
//! subscriptions. Every mutation is diffed against each subscription's
//! filters under the collections lock, so subscribers see changes to a
//! document in the order they were applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use betterish_proto::document::{
    ChangeBatch, Document, Fields, Filter, Query, change_for, merge_patch,
};
use betterish_proto::store::StoreFailure;
use tokio::sync::{RwLock, mpsc};

/// Default maximum number of documents per collection.
const DEFAULT_MAX_DOCUMENTS: usize = 100_000;

/// Changes for one subscription, queued for the owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Subscription the changes belong to.
    pub subscription_id: u64,
    /// The changes.
    pub batch: ChangeBatch,
}

struct Subscriber {
    collection: String,
    filters: Vec<Filter>,
    connection_id: u64,
    sink: mpsc::UnboundedSender<Feed>,
}

/// Thread-safe collections plus the subscription registry.
pub struct DocumentDb {
    collections: RwLock<HashMap<String, BTreeMap<String, Fields>>>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_subscription: AtomicU64,
    max_documents: usize,
}

impl Default for DocumentDb {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentDb {
    /// Creates an empty database with the default per-collection cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_documents(DEFAULT_MAX_DOCUMENTS)
    }

    /// Creates an empty database with a custom per-collection cap.
    #[must_use]
    pub fn with_max_documents(max_documents: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            max_documents,
        }
    }

    /// Inserts a document under a fresh time-ordered ID and returns the ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreFailure::Rejected` when the collection is full.
    pub async fn create(&self, collection: &str, fields: Fields) -> Result<String, StoreFailure> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.len() >= self.max_documents {
            return Err(StoreFailure::Rejected {
                reason: format!("collection {collection} is full ({} documents)", docs.len()),
            });
        }
        let id = uuid::Uuid::now_v7().simple().to_string();
        docs.insert(id.clone(), fields.clone());
        self.notify(collection, &id, None, Some(&fields)).await;
        drop(collections);
        tracing::debug!(collection, id = %id, "document created");
        Ok(id)
    }

    /// Merges `patch` into an existing document.
    ///
    /// # Errors
    ///
    /// Returns `StoreFailure::NotFound` if no such document exists.
    pub async fn update(&self, collection: &str, id: &str, patch: &Fields) -> Result<(), StoreFailure> {
        let mut collections = self.collections.write().await;
        let Some(fields) = collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) else {
            return Err(StoreFailure::NotFound { id: id.to_string() });
        };
        let before = fields.clone();
        merge_patch(fields, patch);
        let after = fields.clone();
        self.notify(collection, id, Some(&before), Some(&after)).await;
        drop(collections);
        tracing::debug!(collection, id, "document updated");
        Ok(())
    }

    /// Removes a document. Removing an absent document is a no-op.
    pub async fn delete(&self, collection: &str, id: &str) {
        let mut collections = self.collections.write().await;
        let removed = collections.get_mut(collection).and_then(|docs| docs.remove(id));
        if let Some(before) = removed {
            self.notify(collection, id, Some(&before), None).await;
            tracing::debug!(collection, id, "document deleted");
        }
    }

    /// Returns a copy of one document's fields.
    pub async fn get(&self, collection: &str, id: &str) -> Option<Fields> {
        let collections = self.collections.read().await;
        collections.get(collection).and_then(|docs| docs.get(id)).cloned()
    }

    /// Runs a query over a collection.
    pub async fn query(&self, collection: &str, query: &Query) -> Vec<Document> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Vec::new();
        };
        let documents: Vec<Document> = docs
            .iter()
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect();
        drop(collections);
        query.select(&documents)
    }

    /// Registers a live feed and returns its subscription ID.
    pub async fn subscribe(
        &self,
        collection: &str,
        filters: Vec<Filter>,
        connection_id: u64,
        sink: mpsc::UnboundedSender<Feed>,
    ) -> u64 {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                collection: collection.to_string(),
                filters,
                connection_id,
                sink,
            },
        );
        tracing::debug!(collection, subscription_id = id, connection_id, "subscribed");
        id
    }

    /// Drops a feed. Only the owning connection may drop it; returns whether
    /// anything was removed.
    pub async fn unsubscribe(&self, subscription_id: u64, connection_id: u64) -> bool {
        let mut subscribers = self.subscribers.write().await;
        if subscribers
            .get(&subscription_id)
            .is_some_and(|s| s.connection_id == connection_id)
        {
            subscribers.remove(&subscription_id);
            return true;
        }
        false
    }

    /// Drops every feed of a connection, returning how many were removed.
    pub async fn unsubscribe_connection(&self, connection_id: u64) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|_, s| s.connection_id != connection_id);
        before - subscribers.len()
    }

    /// Returns the number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Fans a single-document transition out to every interested subscriber.
    ///
    /// Called with the collections lock held.
    async fn notify(
        &self,
        collection: &str,
        id: &str,
        before: Option<&Fields>,
        after: Option<&Fields>,
    ) {
        let subscribers = self.subscribers.read().await;
        for (subscription_id, sub) in subscribers.iter() {
            if sub.collection != collection {
                continue;
            }
            if let Some(change) = change_for(id, before, after, &sub.filters) {
                let feed = Feed {
                    subscription_id: *subscription_id,
                    batch: ChangeBatch {
                        changes: vec![change],
                    },
                };
                if sub.sink.send(feed).is_err() {
                    tracing::debug!(subscription_id, "subscriber gone, skipping");
                }
            }
        }
    }
}
