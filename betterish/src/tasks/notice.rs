//! User-facing failure notices.

use betterish_proto::task::{TaskId, Timestamp};

use super::ErrorKind;

/// Identifier of a notice, unique per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NoticeId(pub u64);

/// A dismissible message telling the user an optimistic change was undone
/// or could not be made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: NoticeId,
    pub kind: ErrorKind,
    pub message: String,
    /// The task the failure concerns, if any.
    pub task_id: Option<TaskId>,
    pub at: Timestamp,
}

/// Notices waiting to be dismissed, oldest first.
#[derive(Debug, Default)]
pub(crate) struct NoticeBoard {
    notices: Vec<Notice>,
    next_id: u64,
}

impl NoticeBoard {
    pub(crate) fn post(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        task_id: Option<TaskId>,
    ) -> Notice {
        self.next_id += 1;
        let notice = Notice {
            id: NoticeId(self.next_id),
            kind,
            message: message.into(),
            task_id,
            at: Timestamp::now(),
        };
        self.notices.push(notice.clone());
        notice
    }

    pub(crate) fn dismiss(&mut self, id: NoticeId) -> bool {
        let before = self.notices.len();
        self.notices.retain(|n| n.id != id);
        self.notices.len() != before
    }

    pub(crate) fn list(&self) -> Vec<Notice> {
        self.notices.clone()
    }

    pub(crate) fn clear(&mut self) {
        self.notices.clear();
    }
}

/// Message shown when an operation of the given kind fails.
pub(crate) const fn describe(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Connectivity => "Could not reach the server. Your change was undone.",
        ErrorKind::Authorization => "You are not allowed to change this task.",
        ErrorKind::NotFound => "This task no longer exists.",
        ErrorKind::Validation => "That change is not valid.",
        ErrorKind::Unknown => "Something went wrong. Your change was undone.",
    }
}
