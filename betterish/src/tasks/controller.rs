//! Optimistic task controller.
//!
//! Every intent follows the same path:
//!
//! 1. The change is applied to the local [`TaskView`] at once and recorded as
//!    a [`PendingOperation`] holding its inverse.
//! 2. The operation waits its turn in the task's lane, a FIFO that serializes
//!    store calls for one task. Different tasks proceed concurrently.
//! 3. The store call runs, retrying connectivity failures per the
//!    [`RetryPolicy`].
//! 4. On success the operation is confirmed; a create also rewrites the
//!    temporary ID to the store's ID everywhere it appears. On failure the
//!    inverse is applied and, unless the failure was a validation problem, a
//!    [`Notice`] is posted.
//!
//! When an operation fails while later ones on the same task are still
//! queued, its inverse is applied underneath them: the queued changes are
//! undone, the failed one is reverted, and the queued ones are replayed.
//!
//! Remote changes for a task with operations in flight are held back and
//! applied once the last of them resolves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use betterish_proto::task::{
    NewTask, Subtask, Task, TaskId, TaskPatch, Timestamp, ValidationError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::notice::{self, Notice, NoticeBoard, NoticeId};
use super::reducer::Action;
use super::service::{TaskChange, TaskService};
use super::sync;
use super::view::TaskView;
use super::{ErrorKind, TaskError};
use crate::store::DocumentStore;

/// How long a confirmed delete can be undone.
pub const DEFAULT_UNDO_WINDOW: Duration = Duration::from_secs(5);

/// Capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Retry behaviour for connectivity failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    /// Delay before the first retry; doubles for each later one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Controller tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub retry: RetryPolicy,
    pub undo_window: Duration,
    pub event_buffer: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            undo_window: DEFAULT_UNDO_WINDOW,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Identifier of an operation, unique per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

/// What an operation does to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Complete,
    Uncomplete,
    Delete,
    Restore,
    Purge,
}

/// Lifecycle of an operation.
///
/// `Idle -> OptimisticallyApplied -> Confirmed | RolledBack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationPhase {
    Idle,
    OptimisticallyApplied,
    Confirmed,
    RolledBack,
}

/// A phase change the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid operation transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: OperationPhase,
    pub to: OperationPhase,
}

impl From<InvalidTransition> for TaskError {
    fn from(err: InvalidTransition) -> Self {
        Self::Unknown(err.to_string())
    }
}

impl OperationPhase {
    /// Moves to `next` if the lifecycle allows it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for any other move, including leaving a
    /// terminal phase.
    pub const fn advance(self, next: Self) -> Result<Self, InvalidTransition> {
        match (self, next) {
            (Self::Idle, Self::OptimisticallyApplied)
            | (Self::OptimisticallyApplied, Self::Confirmed | Self::RolledBack) => Ok(next),
            _ => Err(InvalidTransition {
                from: self,
                to: next,
            }),
        }
    }

    /// Whether the operation has resolved.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }
}

/// An intent that has been applied locally and is awaiting the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub task_id: TaskId,
    pub kind: OperationKind,
    pub phase: OperationPhase,
    pub issued_at: Timestamp,
    action: Action,
    inverse: Action,
}

impl PendingOperation {
    fn transition(&mut self, next: OperationPhase) -> Result<(), InvalidTransition> {
        self.phase = self.phase.advance(next)?;
        Ok(())
    }
}

/// Events emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// The view changed and should be re-read.
    ViewChanged,
    /// A failure the user should see.
    Notice(Notice),
    /// An operation reached a terminal phase.
    Resolved {
        operation: OperationId,
        task_id: TaskId,
        phase: OperationPhase,
    },
}

enum Intent {
    Create(Task),
    Update(TaskPatch),
    Complete(Timestamp),
    Uncomplete,
    Delete,
    Restore(Task),
    Purge,
}

impl Intent {
    const fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::Create,
            Self::Update(_) => OperationKind::Update,
            Self::Complete(_) => OperationKind::Complete,
            Self::Uncomplete => OperationKind::Uncomplete,
            Self::Delete => OperationKind::Delete,
            Self::Restore(_) => OperationKind::Restore,
            Self::Purge => OperationKind::Purge,
        }
    }

    fn action(&self, id: &TaskId) -> Action {
        match self {
            Self::Create(task) => Action::Add(task.clone()),
            Self::Update(patch) => Action::Update {
                id: id.clone(),
                patch: patch.clone(),
            },
            Self::Complete(at) => Action::Complete {
                id: id.clone(),
                at: *at,
            },
            Self::Uncomplete => Action::Uncomplete { id: id.clone() },
            Self::Delete | Self::Purge => Action::Delete { id: id.clone() },
            Self::Restore(task) => Action::Restore(Task {
                id: id.clone(),
                ..task.clone()
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    ops: VecDeque<PendingOperation>,
    deferred: Option<TaskChange>,
}

#[derive(Debug)]
struct UndoRecord {
    task: Task,
    expires_at: Instant,
}

type Lane = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
struct ControllerState {
    view: TaskView,
    pending: HashMap<TaskId, Ledger>,
    /// Temporary ID -> store ID, for creates that have been confirmed.
    aliases: HashMap<TaskId, TaskId>,
    undo: HashMap<TaskId, UndoRecord>,
    lanes: HashMap<TaskId, Lane>,
    notices: NoticeBoard,
    /// Bumped whenever a task's local state settles or takes a remote change.
    epoch: u64,
    /// Loads started by `refresh` and not yet applied.
    refreshing: usize,
    /// Tasks that settled or changed while a load was out, by epoch.
    touched: HashMap<TaskId, u64>,
}

impl ControllerState {
    fn resolve(&self, id: &TaskId) -> TaskId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn lane(&mut self, id: &TaskId) -> Lane {
        Arc::clone(self.lanes.entry(id.clone()).or_default())
    }

    fn prune_lane(&mut self, id: &TaskId) {
        if self.lanes.get(id).is_some_and(|lane| Arc::strong_count(lane) == 1) {
            self.lanes.remove(id);
        }
    }

    fn take_op(&mut self, id: &TaskId, op: OperationId) -> Option<PendingOperation> {
        let key = self.resolve(id);
        let ledger = self.pending.get_mut(&key)?;
        let index = ledger.ops.iter().position(|p| p.id == op)?;
        ledger.ops.remove(index)
    }

    /// Drops the task's ledger once nothing is in flight, applying any
    /// remote change held back meanwhile. Returns whether the view changed.
    fn settle(&mut self, id: &TaskId) -> bool {
        let key = self.resolve(id);
        if self.pending.get(&key).is_some_and(|l| l.ops.is_empty()) {
            if let Some(change) = self.pending.remove(&key).and_then(|l| l.deferred) {
                tracing::debug!(task_id = %key, "applying deferred remote change");
                return sync::apply_change(&mut self.view, change);
            }
        }
        false
    }

    fn touch(&mut self, id: &TaskId) {
        self.epoch += 1;
        if self.refreshing > 0 {
            self.touched.insert(id.clone(), self.epoch);
        }
    }

    fn begin_refresh(&mut self) -> u64 {
        self.refreshing += 1;
        self.epoch
    }

    /// Tasks touched after `since`. A snapshot read before then is stale
    /// for them.
    fn end_refresh(&mut self, since: u64) -> HashSet<TaskId> {
        self.refreshing = self.refreshing.saturating_sub(1);
        let fresher = self
            .touched
            .iter()
            .filter(|(_, at)| **at > since)
            .map(|(id, _)| id.clone())
            .collect();
        if self.refreshing == 0 {
            self.touched.clear();
        }
        fresher
    }

    /// Reverts `failed` underneath the operations still queued for `key`.
    ///
    /// Queued operations are undone newest first, the failed inverse is
    /// applied, then the queued ones are replayed in order and their
    /// inverses recomputed against the new state.
    fn unwind(&mut self, key: &TaskId, failed: &PendingOperation) {
        let Self { view, pending, .. } = self;
        let queued: &mut [PendingOperation] = match pending.get_mut(key) {
            Some(ledger) => ledger.ops.make_contiguous(),
            None => &mut [],
        };
        for op in queued.iter().rev() {
            if let Err(e) = view.apply(op.inverse.clone()) {
                tracing::debug!(op = op.id.0, error = %e, "queued operation could not be undone");
            }
        }
        if let Err(e) = view.apply(failed.inverse.clone()) {
            tracing::debug!(op = failed.id.0, error = %e, "inverse no longer applies");
        }
        for op in queued.iter_mut() {
            match view.apply(op.action.clone()) {
                Ok(inverse) => op.inverse = inverse,
                Err(e) => {
                    tracing::debug!(op = op.id.0, error = %e, "queued operation no longer applies");
                }
            }
        }
    }

    /// Rewrites a confirmed create's temporary ID to its store ID.
    fn adopt(&mut self, temp: &TaskId, canonical: &TaskId) {
        self.view.rekey(temp, canonical);
        self.aliases.insert(temp.clone(), canonical.clone());

        if let Some(mut ledger) = self.pending.remove(temp) {
            for op in &mut ledger.ops {
                op.task_id = canonical.clone();
                op.action.retarget(temp, canonical);
                op.inverse.retarget(temp, canonical);
            }
            if let Some(existing) = self.pending.remove(canonical) {
                ledger.ops.extend(existing.ops);
                ledger.deferred = ledger.deferred.or(existing.deferred);
            }
            self.pending.insert(canonical.clone(), ledger);
        }
        if let Some(lane) = self.lanes.remove(temp) {
            self.lanes.entry(canonical.clone()).or_insert(lane);
        }
    }
}

/// Key under which a remote change must wait, if its task has operations in
/// flight. The echo of an unconfirmed create is matched by its `client_ref`.
fn pending_key(
    pending: &HashMap<TaskId, Ledger>,
    aliases: &HashMap<TaskId, TaskId>,
    change: &TaskChange,
) -> Option<TaskId> {
    let busy = |id: &TaskId| pending.get(id).is_some_and(|l| !l.ops.is_empty());
    let id = change.id();
    if busy(id) {
        return Some(id.clone());
    }
    if let TaskChange::Upserted(task) = change {
        let temp = task.client_ref.as_deref().map(TaskId::parse)?;
        if temp.is_temporary() {
            let key = aliases.get(&temp).cloned().unwrap_or(temp);
            if busy(&key) {
                return Some(key);
            }
        }
    }
    None
}

const fn surfaces(kind: ErrorKind) -> bool {
    !matches!(kind, ErrorKind::Validation)
}

/// Optimistic front end to a [`TaskService`] for one owner.
pub struct TaskController<S> {
    service: TaskService<S>,
    owner: String,
    options: ControllerOptions,
    state: Mutex<ControllerState>,
    events: mpsc::Sender<TaskEvent>,
    mounted: AtomicBool,
    next_op: AtomicU64,
}

impl<S> std::fmt::Debug for TaskController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskController")
            .field("owner", &self.owner)
            .field("mounted", &self.mounted.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<S: DocumentStore> TaskController<S> {
    /// Creates a controller with an empty view.
    ///
    /// Returns the controller and the receiver for its events.
    #[must_use]
    pub fn new(
        service: TaskService<S>,
        owner: impl Into<String>,
        options: ControllerOptions,
    ) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (events, rx) = mpsc::channel(options.event_buffer.max(1));
        let controller = Self {
            service,
            owner: owner.into(),
            options,
            state: Mutex::new(ControllerState::default()),
            events,
            mounted: AtomicBool::new(true),
            next_op: AtomicU64::new(1),
        };
        (controller, rx)
    }

    /// The owner this controller acts for.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The underlying service.
    #[must_use]
    pub const fn service(&self) -> &TaskService<S> {
        &self.service
    }

    /// Whether results are still being applied.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Stops applying results. Operations still in flight finish against the
    /// store but their outcomes are discarded.
    pub fn teardown(&self) {
        if self.mounted.swap(false, Ordering::SeqCst) {
            let mut state = self.state.lock();
            state.pending.clear();
            state.undo.clear();
            tracing::debug!(owner = %self.owner, "task controller torn down");
        }
    }

    // --- reads ---

    /// All visible tasks, newest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().view.tasks().into_iter().cloned().collect()
    }

    /// Looks up a task by temporary or store ID.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        let state = self.state.lock();
        state.view.get(&state.resolve(id)).cloned()
    }

    /// Runs `f` against the current view.
    pub fn with_view<R>(&self, f: impl FnOnce(&TaskView) -> R) -> R {
        f(&self.state.lock().view)
    }

    /// Maps a confirmed temporary ID to its store ID; other IDs map to
    /// themselves.
    #[must_use]
    pub fn resolve(&self, id: &TaskId) -> TaskId {
        self.state.lock().resolve(id)
    }

    /// Operations applied locally but not yet resolved, in issue order.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        let state = self.state.lock();
        let mut ops: Vec<_> = state
            .pending
            .values()
            .flat_map(|l| l.ops.iter().cloned())
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Whether the task has operations in flight.
    #[must_use]
    pub fn is_pending(&self, id: &TaskId) -> bool {
        let state = self.state.lock();
        state
            .pending
            .get(&state.resolve(id))
            .is_some_and(|l| !l.ops.is_empty())
    }

    /// Notices not yet dismissed, oldest first.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.state.lock().notices.list()
    }

    /// Dismisses a notice. Returns `false` if it was already gone.
    pub fn dismiss_notice(&self, id: NoticeId) -> bool {
        self.state.lock().notices.dismiss(id)
    }

    /// Dismisses every notice.
    pub fn clear_notices(&self) {
        self.state.lock().notices.clear();
    }

    /// Whether a deleted task can still be brought back.
    #[must_use]
    pub fn can_undo(&self, id: &TaskId) -> bool {
        let state = self.state.lock();
        state
            .undo
            .get(&state.resolve(id))
            .is_some_and(|r| r.expires_at > Instant::now())
    }

    // --- intents ---

    /// Adds a task. It is visible under a temporary ID at once.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Validation`] without touching the view or the
    /// store, or the store failure that rolled the add back. On success
    /// returns the store-assigned ID.
    pub async fn add(&self, new: NewTask) -> Result<TaskId, TaskError> {
        let task = Task::from_new(TaskId::temporary(), self.owner.clone(), new, Timestamp::now());
        let id = task.id.clone();
        self.execute(id, Intent::Create(task)).await
    }

    /// Edits a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Validation`] or [`TaskError::NotFound`] without
    /// touching the store, or the store failure that rolled the edit back.
    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<TaskId, TaskError> {
        self.execute(id.clone(), Intent::Update(patch)).await
    }

    /// Marks a task done now.
    ///
    /// # Errors
    ///
    /// As for [`Self::update`].
    pub async fn complete(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        self.execute(id.clone(), Intent::Complete(Timestamp::now()))
            .await
    }

    /// Clears a task's completion.
    ///
    /// # Errors
    ///
    /// As for [`Self::update`].
    pub async fn uncomplete(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        self.execute(id.clone(), Intent::Uncomplete).await
    }

    /// Hides a task until `until`, or un-snoozes it with `None`.
    ///
    /// # Errors
    ///
    /// As for [`Self::update`].
    pub async fn snooze(&self, id: &TaskId, until: Option<Timestamp>) -> Result<TaskId, TaskError> {
        self.update(id, TaskPatch::snooze(until)).await
    }

    /// Deletes a task. A task the store no longer has counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if the task is not visible, or the
    /// store failure that rolled the delete back.
    pub async fn delete(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        self.execute(id.clone(), Intent::Delete).await
    }

    /// Restores a task deleted within the undo window.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if there is nothing to undo, or the
    /// store failure that rolled the restore back.
    ///
    /// A failed restore leaves the task undoable until the window closes.
    pub async fn undo_delete(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        let (key, record) = {
            let mut state = self.state.lock();
            let key = state.resolve(id);
            let now = Instant::now();
            state.undo.retain(|_, r| r.expires_at > now);
            let record = state
                .undo
                .remove(&key)
                .ok_or_else(|| TaskError::NotFound(key.to_string()))?;
            (key, record)
        };
        let result = self
            .execute(key.clone(), Intent::Restore(record.task.clone()))
            .await;
        if result.is_err() && self.is_mounted() && record.expires_at > Instant::now() {
            tracing::debug!(task_id = %key, "restore failed, undo still available");
            self.state.lock().undo.entry(key).or_insert(record);
        }
        result
    }

    /// Removes a task from the store for good. It cannot be undone.
    ///
    /// # Errors
    ///
    /// As for [`Self::delete`].
    pub async fn purge(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        self.execute(id.clone(), Intent::Purge).await
    }

    /// Archives a task: it stays stored but leaves the working lists.
    ///
    /// # Errors
    ///
    /// As for [`Self::update`].
    pub async fn archive(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        self.update(id, TaskPatch::archive(true)).await
    }

    /// Brings an archived task back.
    ///
    /// # Errors
    ///
    /// As for [`Self::update`].
    pub async fn unarchive(&self, id: &TaskId) -> Result<TaskId, TaskError> {
        self.update(id, TaskPatch::archive(false)).await
    }

    /// Archives several tasks at once. Each task's result is independent.
    pub async fn archive_many(&self, ids: &[TaskId]) -> Vec<Result<TaskId, TaskError>> {
        futures_util::future::join_all(ids.iter().map(|id| self.archive(id))).await
    }

    /// Turns a task into a project with one subtask per title, numbered
    /// from 1. Existing subtasks are replaced.
    ///
    /// # Errors
    ///
    /// [`TaskError::Validation`] for a blank title or too many subtasks,
    /// otherwise as for [`Self::update`].
    pub async fn convert_to_project(
        &self,
        id: &TaskId,
        titles: &[String],
    ) -> Result<TaskId, TaskError> {
        let subtasks = titles
            .iter()
            .zip(1..)
            .map(|(title, n)| Subtask::new(n, title))
            .collect();
        self.update(id, TaskPatch::project(subtasks)).await
    }

    /// Appends an open subtask to a project.
    ///
    /// # Errors
    ///
    /// [`TaskError::Validation`] if the task is not a project or the title is
    /// blank, otherwise as for [`Self::update`].
    pub async fn add_subtask(&self, id: &TaskId, title: &str) -> Result<TaskId, TaskError> {
        self.edit_subtasks(id, |task| {
            let mut subtasks = task.subtasks.clone();
            subtasks.push(Subtask::new(task.next_subtask_id(), title));
            Ok(subtasks)
        })
        .await
    }

    /// Marks a subtask done (`true`) or open (`false`).
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for an unknown subtask, otherwise as for
    /// [`Self::add_subtask`].
    pub async fn set_subtask_done(
        &self,
        id: &TaskId,
        subtask: u32,
        done: bool,
    ) -> Result<TaskId, TaskError> {
        let at = Timestamp::now();
        self.edit_subtask(id, subtask, move |s| {
            if s.is_done() != done {
                s.completed_at = done.then_some(at);
            }
        })
        .await
    }

    /// Renames a subtask.
    ///
    /// # Errors
    ///
    /// As for [`Self::set_subtask_done`].
    pub async fn rename_subtask(
        &self,
        id: &TaskId,
        subtask: u32,
        title: &str,
    ) -> Result<TaskId, TaskError> {
        self.edit_subtask(id, subtask, |s| s.title = title.trim().to_string())
            .await
    }

    async fn edit_subtask(
        &self,
        id: &TaskId,
        subtask: u32,
        edit: impl FnOnce(&mut Subtask) + Send,
    ) -> Result<TaskId, TaskError> {
        self.edit_subtasks(id, |task| {
            let mut subtasks = task.subtasks.clone();
            let target = subtasks
                .iter_mut()
                .find(|s| s.id == subtask)
                .ok_or_else(|| TaskError::NotFound(format!("{}#{subtask}", task.id)))?;
            edit(target);
            Ok(subtasks)
        })
        .await
    }

    /// Replaces a project's subtasks with a list computed from its current
    /// local value.
    async fn edit_subtasks(
        &self,
        id: &TaskId,
        edit: impl FnOnce(&Task) -> Result<Vec<Subtask>, TaskError> + Send,
    ) -> Result<TaskId, TaskError> {
        self.execute_with(id.clone(), |view, key| {
            let task = view
                .get(key)
                .ok_or_else(|| TaskError::NotFound(key.to_string()))?;
            if !task.is_project {
                return Err(ValidationError::NotAProject.into());
            }
            Ok(Intent::Update(TaskPatch::subtasks(edit(task)?)))
        })
        .await
    }

    /// Completes several tasks at once. Each task's result is independent.
    pub async fn complete_many(&self, ids: &[TaskId]) -> Vec<Result<TaskId, TaskError>> {
        futures_util::future::join_all(ids.iter().map(|id| self.complete(id))).await
    }

    /// Replaces the view with the store's current tasks, keeping local state
    /// for tasks with operations in flight. Returns the number of visible
    /// tasks.
    ///
    /// # Errors
    ///
    /// Returns the load failure; the view is left unchanged and a notice is
    /// posted.
    ///
    /// Tasks whose local state settled while the load was out are kept
    /// as well, since the snapshot predates them.
    pub async fn refresh(&self) -> Result<usize, TaskError> {
        let since = self.state.lock().begin_refresh();
        let loaded = self.service.load(&self.owner).await;
        let mut state = self.state.lock();
        let fresher = state.end_refresh(since);

        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(owner = %self.owner, error = %err, "refresh failed");
                let posted = (self.is_mounted() && surfaces(err.kind())).then(|| {
                    state
                        .notices
                        .post(err.kind(), "Could not load your tasks.", None)
                });
                drop(state);
                if let Some(posted) = posted {
                    self.emit(TaskEvent::Notice(posted));
                }
                return Err(err);
            }
        };
        if !self.is_mounted() {
            return Ok(0);
        }

        let visible = {
            let mut preserve: HashSet<TaskId> = state
                .pending
                .iter()
                .filter(|(_, l)| !l.ops.is_empty())
                .map(|(id, _)| id.clone())
                .collect();
            if !fresher.is_empty() {
                tracing::debug!(count = fresher.len(), "keeping tasks that changed during load");
                preserve.extend(fresher);
            }
            let in_flight: HashSet<String> = preserve
                .iter()
                .filter(|id| id.is_temporary())
                .map(ToString::to_string)
                .collect();
            let snapshot: Vec<Task> = snapshot
                .into_iter()
                .filter(|t| t.client_ref.as_ref().is_none_or(|r| !in_flight.contains(r)))
                .collect();
            state.view.apply(Action::ReplaceAll { snapshot, preserve })?;
            state.view.len()
        };
        drop(state);
        tracing::debug!(owner = %self.owner, visible, "view refreshed");
        self.emit(TaskEvent::ViewChanged);
        Ok(visible)
    }

    /// Folds a batch of remote changes into the view.
    pub fn apply_remote(&self, changes: Vec<TaskChange>) {
        if !self.is_mounted() || changes.is_empty() {
            return;
        }
        let total = changes.len();
        let deferred = {
            let mut guard = self.state.lock();
            let ControllerState {
                view,
                pending,
                aliases,
                ..
            } = &mut *guard;
            let ids: Vec<TaskId> = changes.iter().map(|c| c.id().clone()).collect();
            let deferred = sync::fold_batch(view, changes, |c| pending_key(pending, aliases, c));
            let count = deferred.len();
            let held: HashSet<TaskId> = deferred.iter().map(|(_, c)| c.id().clone()).collect();
            for (key, change) in deferred {
                if let Some(ledger) = pending.get_mut(&key) {
                    ledger.deferred = Some(change);
                }
            }
            for id in ids.iter().filter(|id| !held.contains(id)) {
                guard.touch(id);
            }
            count
        };
        if deferred > 0 {
            tracing::debug!(deferred, "held back remote changes for pending tasks");
        }
        if total > deferred {
            self.emit(TaskEvent::ViewChanged);
        }
    }

    // --- execution ---

    async fn execute(&self, id: TaskId, intent: Intent) -> Result<TaskId, TaskError> {
        self.execute_with(id, move |_, _| Ok(intent)).await
    }

    /// Builds the intent from the current view under the state lock, so it
    /// sees every earlier optimistic change to the task.
    async fn execute_with(
        &self,
        id: TaskId,
        build: impl FnOnce(&TaskView, &TaskId) -> Result<Intent, TaskError> + Send,
    ) -> Result<TaskId, TaskError> {
        if !self.is_mounted() {
            return Err(TaskError::Unknown("task controller has been torn down".into()));
        }
        let op_id = OperationId(self.next_op.fetch_add(1, Ordering::Relaxed));

        let (key, lane, intent) = {
            let mut state = self.state.lock();
            let key = state.resolve(&id);
            let intent = build(&state.view, &key)?;
            let kind = intent.kind();
            let action = intent.action(&key);
            let inverse = state.view.apply(action.clone())?;
            let mut op = PendingOperation {
                id: op_id,
                task_id: key.clone(),
                kind,
                phase: OperationPhase::Idle,
                issued_at: Timestamp::now(),
                action,
                inverse,
            };
            op.transition(OperationPhase::OptimisticallyApplied)?;
            state.pending.entry(key.clone()).or_default().ops.push_back(op);
            let lane = state.lane(&key);
            (key, lane, intent)
        };
        tracing::debug!(op = op_id.0, task_id = %key, kind = ?intent.kind(), "applied optimistically");
        self.emit(TaskEvent::ViewChanged);

        let result = {
            let _turn = lane.lock().await;
            self.run(op_id, &key, &intent).await
        };

        drop(lane);
        let mut state = self.state.lock();
        let current = state.resolve(&key);
        state.prune_lane(&current);
        state.prune_lane(&key);
        result
    }

    async fn run(&self, op_id: OperationId, key: &TaskId, intent: &Intent) -> Result<TaskId, TaskError> {
        let target = self.state.lock().resolve(key);
        if target.is_temporary() && !matches!(intent, Intent::Create(_)) {
            self.cancel(op_id, &target);
            return Err(TaskError::NotFound(target.to_string()));
        }

        let result = self.call_with_retry(&target, intent).await;
        if !self.is_mounted() {
            tracing::debug!(op = op_id.0, task_id = %target, "discarding result after teardown");
            return result.map(|created| created.unwrap_or(target));
        }

        match result {
            Ok(created) => {
                let canonical = created.clone().unwrap_or_else(|| target.clone());
                self.confirm(op_id, &target, created);
                Ok(canonical)
            }
            Err(TaskError::NotFound(_)) if matches!(intent, Intent::Delete | Intent::Purge) => {
                tracing::debug!(task_id = %target, "delete target already gone");
                self.confirm(op_id, &target, None);
                Ok(target)
            }
            Err(err) => {
                self.roll_back(op_id, &target, &err);
                Err(err)
            }
        }
    }

    async fn call_with_retry(
        &self,
        target: &TaskId,
        intent: &Intent,
    ) -> Result<Option<TaskId>, TaskError> {
        let policy = self.options.retry;
        let mut attempt = 0;
        loop {
            match self.call_store(target, intent).await {
                Err(err)
                    if err.kind() == ErrorKind::Connectivity
                        && attempt < policy.retries
                        && self.is_mounted() =>
                {
                    let delay = policy.delay(attempt);
                    tracing::debug!(attempt, ?delay, task_id = %target, error = %err, "retrying store call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn call_store(&self, target: &TaskId, intent: &Intent) -> Result<Option<TaskId>, TaskError> {
        match intent {
            Intent::Create(task) => self.service.create(task).await.map(Some),
            Intent::Update(patch) => self.service.update(target, patch).await.map(|()| None),
            Intent::Complete(at) => self
                .service
                .set_completion(target, Some(*at))
                .await
                .map(|()| None),
            Intent::Uncomplete => self.service.set_completion(target, None).await.map(|()| None),
            Intent::Delete => self.service.delete(target).await.map(|()| None),
            Intent::Restore(_) => self.service.restore(target).await.map(|()| None),
            Intent::Purge => self.service.purge(target).await.map(|()| None),
        }
    }

    fn confirm(&self, op_id: OperationId, target: &TaskId, created: Option<TaskId>) {
        let mut state = self.state.lock();
        let key = match created {
            Some(canonical) => {
                state.adopt(target, &canonical);
                tracing::debug!(temp = %target, task_id = %canonical, "create confirmed");
                canonical
            }
            None => target.clone(),
        };
        let Some(mut op) = state.take_op(&key, op_id) else {
            return;
        };
        if let Err(e) = op.transition(OperationPhase::Confirmed) {
            tracing::warn!(op = op_id.0, error = %e, "confirming operation");
        }
        match (&op.kind, &op.inverse) {
            (OperationKind::Delete, Action::Restore(task)) => {
                let task = Task {
                    id: key.clone(),
                    ..task.clone()
                };
                let expires_at = Instant::now() + self.options.undo_window;
                state.undo.insert(key.clone(), UndoRecord { task, expires_at });
            }
            (OperationKind::Restore | OperationKind::Purge, _) => {
                state.undo.remove(&key);
            }
            _ => {}
        }
        state.touch(&key);
        let changed = state.settle(&key);
        drop(state);

        self.emit(TaskEvent::Resolved {
            operation: op_id,
            task_id: key,
            phase: op.phase,
        });
        if changed {
            self.emit(TaskEvent::ViewChanged);
        }
    }

    fn roll_back(&self, op_id: OperationId, target: &TaskId, err: &TaskError) {
        let mut state = self.state.lock();
        let key = state.resolve(target);
        let Some(mut op) = state.take_op(&key, op_id) else {
            return;
        };
        if let Err(e) = op.transition(OperationPhase::RolledBack) {
            tracing::warn!(op = op_id.0, error = %e, "rolling back operation");
        }
        state.unwind(&key, &op);
        state.touch(&key);
        tracing::warn!(op = op_id.0, task_id = %key, kind = ?op.kind, error = %err, "operation rolled back");

        let kind = err.kind();
        let posted = surfaces(kind).then(|| {
            state
                .notices
                .post(kind, notice::describe(kind), Some(key.clone()))
        });
        state.settle(&key);
        drop(state);

        self.emit(TaskEvent::ViewChanged);
        self.emit(TaskEvent::Resolved {
            operation: op_id,
            task_id: key,
            phase: op.phase,
        });
        if let Some(posted) = posted {
            self.emit(TaskEvent::Notice(posted));
        }
    }

    /// Drops an operation queued behind a create that failed. Its task no
    /// longer exists, so there is nothing to undo and nothing to report.
    fn cancel(&self, op_id: OperationId, target: &TaskId) {
        let mut state = self.state.lock();
        let Some(mut op) = state.take_op(target, op_id) else {
            return;
        };
        if let Err(e) = op.transition(OperationPhase::RolledBack) {
            tracing::warn!(op = op_id.0, error = %e, "cancelling operation");
        }
        tracing::debug!(op = op_id.0, task_id = %target, "cancelled after failed create");
        state.touch(target);
        let changed = state.settle(target);
        drop(state);

        self.emit(TaskEvent::Resolved {
            operation: op_id,
            task_id: target.clone(),
            phase: op.phase,
        });
        if changed {
            self.emit(TaskEvent::ViewChanged);
        }
    }

    fn emit(&self, event: TaskEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    ?event,
                    capacity = self.options.event_buffer,
                    "event buffer full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("event receiver gone");
            }
        }
    }
}
