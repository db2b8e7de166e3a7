//! Pure state transitions over a [`TaskView`].
//!
//! Every successful [`TaskView::apply`] returns the action that undoes it, so
//! an optimistic change can be rolled back without snapshotting the view.

use std::collections::HashSet;

use betterish_proto::task::{Task, TaskId, TaskPatch, Timestamp};

use super::TaskError;
use super::view::TaskView;

/// A state transition on the task view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Insert a task that is not yet visible.
    Add(Task),
    /// Merge a patch into a visible task.
    Update { id: TaskId, patch: TaskPatch },
    /// Mark a task done at `at`.
    Complete { id: TaskId, at: Timestamp },
    /// Clear a task's completion.
    Uncomplete { id: TaskId },
    /// Hide a task.
    Delete { id: TaskId },
    /// Put a task back exactly as given, replacing any current value.
    Restore(Task),
    /// Replace everything with `snapshot`, except IDs in `preserve`, which
    /// keep their local value (or local absence).
    ReplaceAll {
        snapshot: Vec<Task>,
        preserve: HashSet<TaskId>,
    },
}

impl Action {
    /// The single task this action targets, if any.
    #[must_use]
    pub const fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Add(task) | Self::Restore(task) => Some(&task.id),
            Self::Update { id, .. }
            | Self::Complete { id, .. }
            | Self::Uncomplete { id }
            | Self::Delete { id } => Some(id),
            Self::ReplaceAll { .. } => None,
        }
    }

    /// Points the action at `to` if it currently targets `from`.
    pub fn retarget(&mut self, from: &TaskId, to: &TaskId) {
        match self {
            Self::Add(task) | Self::Restore(task) => {
                if &task.id == from {
                    task.id = to.clone();
                }
            }
            Self::Update { id, .. }
            | Self::Complete { id, .. }
            | Self::Uncomplete { id }
            | Self::Delete { id } => {
                if id == from {
                    *id = to.clone();
                }
            }
            Self::ReplaceAll { .. } => {}
        }
    }
}

impl TaskView {
    /// Applies `action` and returns its inverse.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Validation`] if an added task or patch breaks a task rule
    /// - [`TaskError::NotFound`] if the target task is not visible
    /// - [`TaskError::Unknown`] if an added task's ID is already visible
    ///
    /// The view is unchanged on error.
    pub fn apply(&mut self, action: Action) -> Result<Action, TaskError> {
        match action {
            Action::Add(task) => {
                task.validate()?;
                if self.contains(&task.id) {
                    return Err(TaskError::Unknown(format!("task {} already exists", task.id)));
                }
                let id = task.id.clone();
                self.upsert(task);
                Ok(Action::Delete { id })
            }
            Action::Update { id, patch } => {
                patch.validate()?;
                let task = self.tasks.get_mut(&id).ok_or_else(|| not_found(&id))?;
                let inverse = patch.inverse_for(task);
                patch.apply(task);
                Ok(Action::Update { id, patch: inverse })
            }
            Action::Complete { id, at } => {
                let task = self.tasks.get_mut(&id).ok_or_else(|| not_found(&id))?;
                if task.completed {
                    let at = task.completed_at.unwrap_or(at);
                    return Ok(Action::Complete { id, at });
                }
                task.completed = true;
                task.completed_at = Some(at);
                Ok(Action::Uncomplete { id })
            }
            Action::Uncomplete { id } => {
                let task = self.tasks.get_mut(&id).ok_or_else(|| not_found(&id))?;
                if !task.completed {
                    return Ok(Action::Uncomplete { id });
                }
                let at = task.completed_at.take().unwrap_or_default();
                task.completed = false;
                Ok(Action::Complete { id, at })
            }
            Action::Delete { id } => {
                let task = self.remove(&id).ok_or_else(|| not_found(&id))?;
                Ok(Action::Restore(task))
            }
            Action::Restore(task) => {
                let id = task.id.clone();
                Ok(self
                    .upsert(task)
                    .map_or(Action::Delete { id }, Action::Restore))
            }
            Action::ReplaceAll { snapshot, preserve } => {
                let previous = std::mem::take(&mut self.tasks);
                for task in snapshot {
                    if !preserve.contains(&task.id) {
                        self.tasks.insert(task.id.clone(), task);
                    }
                }
                for id in &preserve {
                    if let Some(task) = previous.get(id) {
                        self.tasks.insert(id.clone(), task.clone());
                    }
                }
                Ok(Action::ReplaceAll {
                    snapshot: previous.into_values().collect(),
                    preserve,
                })
            }
        }
    }
}

fn not_found(id: &TaskId) -> TaskError {
    TaskError::NotFound(id.to_string())
}
