//! Task persistence over a [`DocumentStore`].
//!
//! Translates task operations into document operations on the `tasks`
//! collection and decodes documents and change batches back into tasks.
//! Deletes are soft: the document stays with `deleted = true` so it can be
//! restored, and readers treat such tombstones as absent.

use std::sync::Arc;
use std::time::Duration;

use betterish_proto::document::{
    Change, ChangeBatch, Direction, FieldValue, Fields, Filter, FilterOp, Query,
};
use betterish_proto::task::{
    TASKS_COLLECTION, Task, TaskId, TaskPatch, Timestamp, fields, is_tombstone,
};

use super::TaskError;
use crate::store::{DocumentStore, Subscription};

/// A decoded change to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskChange {
    /// The task was created or modified; this is its current value.
    Upserted(Task),
    /// The task is gone (hard-deleted or tombstoned).
    Removed(TaskId),
}

impl TaskChange {
    /// The task the change applies to.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        match self {
            Self::Upserted(task) => &task.id,
            Self::Removed(id) => id,
        }
    }
}

/// Task operations against a document store.
#[derive(Debug)]
pub struct TaskService<S> {
    store: Arc<S>,
    duplicate_window: Option<Duration>,
}

impl<S> Clone for TaskService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            duplicate_window: self.duplicate_window,
        }
    }
}

impl<S: DocumentStore> TaskService<S> {
    /// Creates a service with duplicate detection off.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self {
            store,
            duplicate_window: None,
        }
    }

    /// Rejects creates whose title matches one of the owner's tasks created
    /// within `window`. `None` disables the check.
    #[must_use]
    pub fn with_duplicate_window(mut self, window: Option<Duration>) -> Self {
        self.duplicate_window = window;
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persists a new task and returns its store-assigned ID.
    ///
    /// A temporary `task.id` is written as the document's `client_ref` so the
    /// creator can recognise the echo of its own write.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Validation`] or [`TaskError::Duplicate`] without
    /// writing, or the classified store failure.
    pub async fn create(&self, task: &Task) -> Result<TaskId, TaskError> {
        task.validate()?;
        if let Some(window) = self.duplicate_window {
            self.check_duplicate(task, window).await?;
        }

        let mut doc = task.to_fields();
        if task.id.is_temporary() {
            doc.insert(fields::CLIENT_REF.into(), FieldValue::Text(task.id.to_string()));
        }
        doc.insert(fields::DELETED.into(), FieldValue::Bool(false));

        let id = self.store.create(TASKS_COLLECTION, doc).await?;
        tracing::debug!(task_id = %id, "task created");
        Ok(TaskId::persisted(id))
    }

    async fn check_duplicate(&self, task: &Task, window: Duration) -> Result<(), TaskError> {
        let since = Timestamp::now().saturating_sub(window);
        let query = Query::new()
            .filter(Filter::eq(fields::OWNER, task.owner.as_str()))
            .filter(Filter::eq(fields::TITLE, task.title.trim()))
            .filter(Filter::new(
                fields::CREATED_AT,
                FilterOp::Ge,
                FieldValue::Timestamp(since.as_millis()),
            ))
            .filter(Filter::new(fields::DELETED, FilterOp::Ne, true))
            .limit(1);
        let found = self.store.query(TASKS_COLLECTION, &query).await?;
        if found.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Duplicate(task.title.trim().to_string()))
        }
    }

    /// Writes the fields `patch` touches.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Validation`] for a bad patch, or the classified
    /// store failure ([`TaskError::NotFound`] if the task does not exist).
    pub async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), TaskError> {
        patch.validate()?;
        if patch.is_empty() {
            return Ok(());
        }
        self.write(id, patch.to_fields()).await
    }

    /// Sets (`Some`) or clears (`None`) a task's completion time.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure.
    pub async fn set_completion(
        &self,
        id: &TaskId,
        completed_at: Option<Timestamp>,
    ) -> Result<(), TaskError> {
        let mut patch = Fields::new();
        patch.insert(fields::COMPLETED.into(), FieldValue::Bool(completed_at.is_some()));
        patch.insert(
            fields::COMPLETED_AT.into(),
            completed_at.map_or(FieldValue::Null, |at| FieldValue::Timestamp(at.as_millis())),
        );
        self.write(id, patch).await
    }

    /// Soft-deletes a task.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure.
    pub async fn delete(&self, id: &TaskId) -> Result<(), TaskError> {
        self.set_deleted(id, true).await
    }

    /// Clears a soft delete.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure; [`TaskError::NotFound`] if the
    /// document has been purged.
    pub async fn restore(&self, id: &TaskId) -> Result<(), TaskError> {
        self.set_deleted(id, false).await
    }

    /// Removes a task's document for good.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure.
    pub async fn purge(&self, id: &TaskId) -> Result<(), TaskError> {
        let raw = persisted(id)?;
        self.store.delete(TASKS_COLLECTION, raw).await?;
        Ok(())
    }

    async fn set_deleted(&self, id: &TaskId, deleted: bool) -> Result<(), TaskError> {
        let mut patch = Fields::new();
        patch.insert(fields::DELETED.into(), FieldValue::Bool(deleted));
        self.write(id, patch).await
    }

    async fn write(&self, id: &TaskId, patch: Fields) -> Result<(), TaskError> {
        let raw = persisted(id)?;
        self.store.update(TASKS_COLLECTION, raw, patch).await?;
        Ok(())
    }

    /// Loads the owner's live tasks, newest first.
    ///
    /// Documents that cannot be decoded are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure.
    pub async fn load(&self, owner: &str) -> Result<Vec<Task>, TaskError> {
        let query = Query::new()
            .filter(Filter::eq(fields::OWNER, owner))
            .filter(Filter::new(fields::DELETED, FilterOp::Ne, true))
            .order_by(fields::CREATED_AT, Direction::Descending);
        let docs = self.store.query(TASKS_COLLECTION, &query).await?;
        let tasks: Vec<Task> = docs
            .iter()
            .filter(|doc| !is_tombstone(&doc.fields))
            .filter_map(|doc| match Task::from_document(doc) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(doc_id = %doc.id, error = %e, "skipping malformed task document");
                    None
                }
            })
            .collect();
        tracing::debug!(owner, count = tasks.len(), "tasks loaded");
        Ok(tasks)
    }

    /// Opens a live feed of the owner's task documents.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure.
    pub async fn subscribe(&self, owner: &str) -> Result<Subscription, TaskError> {
        let subscription = self
            .store
            .subscribe(TASKS_COLLECTION, vec![Filter::eq(fields::OWNER, owner)])
            .await?;
        Ok(subscription)
    }

    /// Decodes a change batch. Tombstones become removals; malformed
    /// documents are logged and skipped.
    #[must_use]
    pub fn decode_batch(batch: ChangeBatch) -> Vec<TaskChange> {
        batch
            .changes
            .into_iter()
            .filter_map(|change| match change {
                Change::Removed { id } => Some(TaskChange::Removed(TaskId::persisted(id))),
                Change::Upserted(doc) if is_tombstone(&doc.fields) => {
                    Some(TaskChange::Removed(TaskId::persisted(doc.id)))
                }
                Change::Upserted(doc) => match Task::from_document(&doc) {
                    Ok(task) => Some(TaskChange::Upserted(task)),
                    Err(e) => {
                        tracing::warn!(doc_id = %doc.id, error = %e, "skipping malformed task change");
                        None
                    }
                },
            })
            .collect()
    }
}

fn persisted(id: &TaskId) -> Result<&str, TaskError> {
    id.as_persisted()
        .ok_or_else(|| TaskError::NotFound(id.to_string()))
}
