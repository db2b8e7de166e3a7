//! Document store abstraction for Betterish.
//!
//! Defines the [`DocumentStore`] trait the task layer talks to. Concrete
//! implementations:
//! - [`memory::MemoryStore`]: in-process store with fault injection, for tests and demo mode
//! - [`remote::RemoteStore`]: WebSocket client for `betterish-store`

pub mod memory;
pub mod remote;

use betterish_proto::document::{ChangeBatch, Document, Fields, Filter, Query};
use betterish_proto::store::StoreFailure;
use tokio::sync::mpsc;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No document with this ID exists.
    #[error("document {0} not found")]
    NotFound(String),

    /// The store could not be reached or the connection dropped.
    #[error("store unreachable: {0}")]
    Connectivity(String),

    /// The store did not answer in time.
    #[error("store operation timed out")]
    Timeout,

    /// The current owner may not access this data.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The store refused the request as invalid.
    #[error("rejected by store: {0}")]
    Rejected(String),

    /// The store failed internally or answered nonsensically.
    #[error("store error: {0}")]
    Internal(String),
}

impl From<StoreFailure> for StoreError {
    fn from(failure: StoreFailure) -> Self {
        match failure {
            StoreFailure::NotFound { id } => Self::NotFound(id),
            StoreFailure::Unauthorized { reason } => Self::Unauthorized(reason),
            StoreFailure::Rejected { reason } => Self::Rejected(reason),
            StoreFailure::Internal { reason } => Self::Internal(reason),
        }
    }
}

/// A live change feed. Dropping it unsubscribes.
pub struct Subscription {
    changes: mpsc::UnboundedReceiver<ChangeBatch>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wraps a change receiver; `cancel` runs once when the subscription is
    /// dropped.
    pub fn new(
        changes: mpsc::UnboundedReceiver<ChangeBatch>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            changes,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Waits for the next batch. Returns `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        self.changes.recv().await
    }

    /// Returns a batch if one is already queued.
    pub fn try_next(&mut self) -> Option<ChangeBatch> {
        self.changes.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Async document store.
///
/// Every call is independent: the store gives no ordering guarantee across
/// concurrent calls, so callers that need ordering must serialize them.
pub trait DocumentStore: Send + Sync {
    /// Declares the owner subsequent calls act for.
    fn authenticate(
        &self,
        owner: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Inserts a document and returns its store-assigned ID.
    fn create(
        &self,
        collection: &str,
        fields: Fields,
    ) -> impl std::future::Future<Output = Result<String, StoreError>> + Send;

    /// Merges `patch` into an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] if the document does not exist.
    fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Fields,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Removes a document. Removing an absent document succeeds.
    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Runs a one-shot query.
    fn query(
        &self,
        collection: &str,
        query: &Query,
    ) -> impl std::future::Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Opens a live feed of changes to documents matching `filters`.
    fn subscribe(
        &self,
        collection: &str,
        filters: Vec<Filter>,
    ) -> impl std::future::Future<Output = Result<Subscription, StoreError>> + Send;
}
