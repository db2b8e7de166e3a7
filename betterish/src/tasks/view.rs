//! The locally visible task collection and its derived lists.

use std::collections::HashMap;
use std::time::Duration;

use betterish_proto::task::{Task, TaskId, Timestamp};
use chrono::Weekday;

/// Age after which an incomplete task counts as a past promise.
const PROMISE_MIN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Age after which an incomplete task is no longer a past promise.
const PROMISE_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Tasks keyed by ID, read newest-first.
///
/// Newest-first means `created_at` descending, ties broken by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskView {
    pub(crate) tasks: HashMap<TaskId, Task>,
}

impl TaskView {
    /// An empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a view from tasks; later duplicates win.
    #[must_use]
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Looks up a task.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Whether a task with this ID is visible.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Number of visible tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All tasks, newest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Inserts or replaces a task, returning the previous value.
    pub(crate) fn upsert(&mut self, task: Task) -> Option<Task> {
        self.tasks.insert(task.id.clone(), task)
    }

    /// Removes a task, returning it.
    pub(crate) fn remove(&mut self, id: &TaskId) -> Option<Task> {
        self.tasks.remove(id)
    }

    /// Moves a task from `from` to `to`, replacing anything under `to`.
    ///
    /// Returns `false` if there was nothing under `from`.
    pub(crate) fn rekey(&mut self, from: &TaskId, to: &TaskId) -> bool {
        let Some(mut task) = self.tasks.remove(from) else {
            return false;
        };
        task.id = to.clone();
        self.tasks.insert(to.clone(), task);
        true
    }

    fn unarchived(&self) -> impl Iterator<Item = &Task> {
        self.tasks().into_iter().filter(|t| !t.archived)
    }

    /// Incomplete, unarchived tasks not hidden by a snooze at `now`, newest
    /// first.
    #[must_use]
    pub fn active(&self, now: Timestamp) -> Vec<&Task> {
        self.unarchived()
            .filter(|t| !t.completed && !t.is_snoozed(now))
            .collect()
    }

    /// Completed, unarchived tasks, most recently completed first.
    #[must_use]
    pub fn completed(&self) -> Vec<&Task> {
        let mut done: Vec<&Task> = self.unarchived().filter(|t| t.completed).collect();
        done.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        done
    }

    /// Incomplete tasks created between one and fourteen days before `now`.
    #[must_use]
    pub fn past_promises(&self, now: Timestamp) -> Vec<&Task> {
        let newest = now.saturating_sub(PROMISE_MIN_AGE);
        let oldest = now.saturating_sub(PROMISE_MAX_AGE);
        self.unarchived()
            .filter(|t| !t.completed && t.created_at <= newest && t.created_at >= oldest)
            .collect()
    }

    /// Archived tasks, newest first.
    #[must_use]
    pub fn archived(&self) -> Vec<&Task> {
        self.tasks().into_iter().filter(|t| t.archived).collect()
    }

    /// Unarchived projects, newest first.
    #[must_use]
    pub fn projects(&self) -> Vec<&Task> {
        self.unarchived().filter(|t| t.is_project).collect()
    }

    /// Recurring tasks that come back on `day`.
    #[must_use]
    pub fn due_on(&self, day: Weekday) -> Vec<&Task> {
        self.unarchived()
            .filter(|t| t.recurrence.as_ref().is_some_and(|r| r.occurs_on(day)))
            .collect()
    }

    /// Case-insensitive match on title or detail. A blank query matches all.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<&Task> {
        let needle = query.trim().to_lowercase();
        self.tasks()
            .into_iter()
            .filter(|t| {
                needle.is_empty()
                    || t.title.to_lowercase().contains(&needle)
                    || t.detail
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .collect()
    }
}
