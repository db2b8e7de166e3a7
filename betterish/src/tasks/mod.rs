//! Optimistic task state management.
//!
//! User intents are applied to a local [`TaskView`] immediately and then
//! reconciled against the document store by the [`TaskController`]. Remote
//! changes stream in through [`TaskSync`] and are folded into the same view.

pub mod controller;
pub mod notice;
pub mod reducer;
pub mod service;
pub mod sync;
pub mod view;

pub use controller::{
    ControllerOptions, OperationId, OperationKind, OperationPhase, PendingOperation, RetryPolicy,
    TaskController, TaskEvent,
};
pub use notice::{Notice, NoticeId};
pub use reducer::Action;
pub use service::{TaskChange, TaskService};
pub use sync::TaskSync;
pub use view::TaskView;

use betterish_proto::task::ValidationError;
use thiserror::Error;

use crate::store::StoreError;

/// Coarse failure class used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Connectivity,
    Authorization,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not found"),
            Self::Connectivity => write!(f, "connectivity"),
            Self::Authorization => write!(f, "authorization"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Input broke a task rule; never sent to the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The owner already created a task with this title recently.
    #[error("duplicate task: {0:?} was created recently")]
    Duplicate(String),
    /// The store refused the request as invalid.
    #[error("rejected by store: {0}")]
    Rejected(String),
    /// Task with the given ID was not found.
    #[error("task not found: {0}")]
    NotFound(String),
    /// The store could not be reached, or did not answer in time.
    #[error("connection problem: {0}")]
    Connectivity(String),
    /// The current owner may not touch this task.
    #[error("not allowed: {0}")]
    Authorization(String),
    /// Anything else.
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl TaskError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Duplicate(_) | Self::Rejected(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Connectivity(reason) => Self::Connectivity(reason),
            StoreError::Timeout => Self::Connectivity("store operation timed out".into()),
            StoreError::Unauthorized(reason) => Self::Authorization(reason),
            StoreError::Rejected(reason) => Self::Rejected(reason),
            StoreError::Internal(reason) => Self::Unknown(reason),
        }
    }
}
