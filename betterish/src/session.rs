//! One owner's live task session.
//!
//! Opening a session authenticates against the store, subscribes to the
//! owner's tasks and loads the initial view. Subscribing first means no change
//! made between the load and the subscription is missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::store::DocumentStore;
use crate::tasks::{ControllerOptions, TaskController, TaskError, TaskEvent, TaskService, TaskSync};

/// Session tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub controller: ControllerOptions,
    /// Reject same-title creates within this window. Off when `None`.
    pub duplicate_window: Option<Duration>,
}

/// A mounted controller plus its change feed.
pub struct Session<S: DocumentStore + 'static> {
    store: Arc<S>,
    options: SessionOptions,
    controller: Arc<TaskController<S>>,
    sync: Option<TaskSync>,
}

impl<S: DocumentStore + 'static> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner", &self.controller.owner())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

impl<S: DocumentStore + 'static> Session<S> {
    /// Opens a session for `owner`.
    ///
    /// Returns the session and the receiver for its controller's events.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of authentication, subscription, or
    /// the initial load.
    pub async fn open(
        store: Arc<S>,
        owner: &str,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::Receiver<TaskEvent>), TaskError> {
        let (controller, sync, events) = mount(&store, owner, &options).await?;
        let session = Self {
            store,
            options,
            controller,
            sync: Some(sync),
        };
        Ok((session, events))
    }

    /// The session's controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<TaskController<S>> {
        &self.controller
    }

    /// The owner the session acts for.
    #[must_use]
    pub fn owner(&self) -> &str {
        self.controller.owner()
    }

    /// Whether the change feed is still running.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.sync.as_ref().is_some_and(TaskSync::is_running)
    }

    /// Tears the current owner down and opens a fresh view for `owner`.
    ///
    /// Results of operations still in flight for the previous owner are
    /// discarded. Returns the receiver for the new controller's events.
    ///
    /// # Errors
    ///
    /// As for [`Self::open`]. On error the session is left closed.
    pub async fn switch_owner(&mut self, owner: &str) -> Result<mpsc::Receiver<TaskEvent>, TaskError> {
        tracing::info!(from = %self.owner(), to = %owner, "switching owner");
        self.unmount();
        let (controller, sync, events) = mount(&self.store, owner, &self.options).await?;
        self.controller = controller;
        self.sync = Some(sync);
        Ok(events)
    }

    /// Stops the feed and discards any late results.
    pub fn close(mut self) {
        self.unmount();
    }

    fn unmount(&mut self) {
        self.controller.teardown();
        self.sync.take();
    }
}

impl<S: DocumentStore + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        self.unmount();
    }
}

async fn mount<S: DocumentStore + 'static>(
    store: &Arc<S>,
    owner: &str,
    options: &SessionOptions,
) -> Result<(Arc<TaskController<S>>, TaskSync, mpsc::Receiver<TaskEvent>), TaskError> {
    store.authenticate(owner).await?;
    let service = TaskService::new(Arc::clone(store)).with_duplicate_window(options.duplicate_window);
    let (controller, events) = TaskController::new(service, owner, options.controller.clone());
    let controller = Arc::new(controller);

    let sync = TaskSync::start(Arc::clone(&controller)).await?;
    let visible = controller.refresh().await?;
    tracing::info!(owner, visible, "session opened");
    Ok((controller, sync, events))
}
