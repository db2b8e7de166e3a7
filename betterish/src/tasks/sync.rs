//! Live synchronisation from the store's change feed.

use std::sync::Arc;

use betterish_proto::task::TaskId;
use tokio::task::JoinHandle;

use super::TaskError;
use super::controller::TaskController;
use super::service::{TaskChange, TaskService};
use super::view::TaskView;
use crate::store::DocumentStore;

/// Applies one authoritative change. Returns whether the view changed.
pub fn apply_change(view: &mut TaskView, change: TaskChange) -> bool {
    match change {
        TaskChange::Upserted(task) => {
            let before = view.get(&task.id).cloned();
            if before.as_ref() == Some(&task) {
                return false;
            }
            view.upsert(task);
            true
        }
        TaskChange::Removed(id) => view.remove(&id).is_some(),
    }
}

/// Applies a batch in order, except changes for which `pending_key` names a
/// task with operations in flight. Those are returned, keyed, for the caller
/// to hold until the task settles.
pub fn fold_batch<F>(
    view: &mut TaskView,
    changes: Vec<TaskChange>,
    mut pending_key: F,
) -> Vec<(TaskId, TaskChange)>
where
    F: FnMut(&TaskChange) -> Option<TaskId>,
{
    let mut deferred = Vec::new();
    for change in changes {
        match pending_key(&change) {
            Some(key) => deferred.push((key, change)),
            None => {
                apply_change(view, change);
            }
        }
    }
    deferred
}

/// A running feed loop for one controller.
///
/// Dropping it stops the loop, which drops the store subscription.
#[derive(Debug)]
pub struct TaskSync {
    owner: String,
    handle: JoinHandle<()>,
}

impl TaskSync {
    /// Subscribes to the controller owner's tasks and starts folding every
    /// batch into the controller's view.
    ///
    /// # Errors
    ///
    /// Returns the subscription failure.
    pub async fn start<S>(controller: Arc<TaskController<S>>) -> Result<Self, TaskError>
    where
        S: DocumentStore + 'static,
    {
        let owner = controller.owner().to_string();
        let mut subscription = controller.service().subscribe(&owner).await?;
        tracing::info!(owner = %owner, "task feed started");

        let handle = tokio::spawn(async move {
            while let Some(batch) = subscription.next().await {
                if !controller.is_mounted() {
                    break;
                }
                let changes = TaskService::<S>::decode_batch(batch);
                tracing::trace!(count = changes.len(), "task changes received");
                controller.apply_remote(changes);
            }
            tracing::debug!(owner = %controller.owner(), "task feed ended");
        });

        Ok(Self { owner, handle })
    }

    /// The owner whose tasks are followed.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether the feed loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the feed loop.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for TaskSync {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!(owner = %self.owner, "task feed stopped");
    }
}
