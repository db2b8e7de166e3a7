//! Plain-text and JSON rendering of tasks for the CLI.

use betterish_proto::task::{Task, Timestamp};

/// Formats a timestamp in local time with a chrono format string.
///
/// Falls back to the raw millisecond value if it is out of range.
#[must_use]
pub fn format_timestamp(ts: Timestamp, format: &str) -> String {
    ts.to_datetime().map_or_else(
        || ts.to_string(),
        |dt| dt.with_timezone(&chrono::Local).format(format).to_string(),
    )
}

/// One line per task: status box, ID, title, then tags.
#[must_use]
pub fn task_line(task: &Task, now: Timestamp, timestamp_format: &str) -> String {
    let mark = if task.completed { "[x]" } else { "[ ]" };
    let mut line = format!("{mark} {:<12} {}", task.id.to_string(), task.title);

    let mut tags = Vec::new();
    if let Some(category) = task.category {
        tags.push(category.to_string());
    }
    tags.push(task.priority.to_string());
    if let Some(recurrence) = &task.recurrence {
        tags.push(recurrence.describe());
    }
    if task.is_snoozed(now)
        && let Some(until) = task.snoozed_until
    {
        tags.push(format!("snoozed until {}", format_timestamp(until, timestamp_format)));
    }
    if task.is_project {
        tags.push(format!("project {}%", task.progress()));
    }
    if task.archived {
        tags.push("archived".to_owned());
    }
    line.push_str(&format!("  ({})", tags.join(", ")));
    line.push_str(&format!("  {}", format_timestamp(task.created_at, timestamp_format)));
    for subtask in &task.subtasks {
        let mark = if subtask.is_done() { "[x]" } else { "[ ]" };
        line.push_str(&format!("\n    {mark} {}. {}", subtask.id, subtask.title));
    }
    line
}

/// A flat JSON object with string IDs and millisecond timestamps.
#[must_use]
pub fn task_json(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id.to_string(),
        "owner": task.owner,
        "title": task.title,
        "detail": task.detail,
        "category": task.category.map(|c| c.as_str()),
        "priority": task.priority.as_str(),
        "completed": task.completed,
        "completed_at": task.completed_at.map(|t| t.as_millis()),
        "created_at": task.created_at.as_millis(),
        "snoozed_until": task.snoozed_until.map(|t| t.as_millis()),
        "recurrence": task.recurrence.as_ref().map(betterish_proto::task::Recurrence::to_tag),
        "archived": task.archived,
        "is_project": task.is_project,
        "progress": task.is_project.then(|| task.progress()),
        "subtasks": task.subtasks.iter().map(|s| serde_json::json!({
            "id": s.id,
            "title": s.title,
            "completed_at": s.completed_at.map(|t| t.as_millis()),
        })).collect::<Vec<_>>(),
    })
}
