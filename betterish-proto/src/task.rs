//! Task model and its document mapping.
//!
//! Tasks are stored as documents in the [`TASKS_COLLECTION`] collection.
//! While a create is in flight the client keys a task by a
//! [`TaskId::Temporary`] ID; once the store assigns one, the task is rekeyed
//! to [`TaskId::Persisted`]. Temporary IDs are never used as document IDs.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Document, FieldValue, Fields, field};

/// Maximum allowed task title length in characters.
pub const MAX_TITLE_LENGTH: usize = 100;

/// Maximum allowed task detail length in characters.
pub const MAX_DETAIL_LENGTH: usize = 500;

/// Maximum number of subtasks on one project.
pub const MAX_SUBTASKS: usize = 50;

/// Collection holding task documents.
pub const TASKS_COLLECTION: &str = "tasks";

const TEMPORARY_PREFIX: &str = "tmp_";

/// Field names of a task document.
pub mod fields {
    pub const OWNER: &str = "owner";
    pub const TITLE: &str = "title";
    pub const DETAIL: &str = "detail";
    pub const CATEGORY: &str = "category";
    pub const PRIORITY: &str = "priority";
    pub const COMPLETED: &str = "completed";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const CREATED_AT: &str = "created_at";
    pub const SNOOZED_UNTIL: &str = "snoozed_until";
    pub const RECURRENCE: &str = "recurrence";
    pub const CLIENT_REF: &str = "client_ref";
    pub const DELETED: &str = "deleted";
    pub const ARCHIVED: &str = "archived";
    pub const IS_PROJECT: &str = "is_project";
    pub const SUBTASKS: &str = "subtasks";
}

/// Identifier of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskId {
    /// Client-generated placeholder used until the store confirms a create.
    Temporary(Uuid),
    /// Store-assigned document ID.
    Persisted(String),
}

impl TaskId {
    /// Creates a fresh time-ordered temporary ID (UUID v7).
    #[must_use]
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::now_v7())
    }

    /// Wraps a store-assigned ID.
    #[must_use]
    pub fn persisted(id: impl Into<String>) -> Self {
        Self::Persisted(id.into())
    }

    /// Parses the textual form produced by `Display`.
    ///
    /// `tmp_<uuid>` yields a temporary ID; anything else is taken as a
    /// store-assigned ID.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        text.strip_prefix(TEMPORARY_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map_or_else(|| Self::persisted(text), Self::Temporary)
    }

    /// Returns `true` for a temporary ID.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns the store-assigned ID, if any.
    #[must_use]
    pub fn as_persisted(&self) -> Option<&str> {
        match self {
            Self::Persisted(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temporary(uuid) => write!(f, "{TEMPORARY_PREFIX}{uuid}"),
            Self::Persisted(id) => f.write_str(id),
        }
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Shifts forward, saturating at the maximum.
    #[must_use]
    pub fn saturating_add(self, by: std::time::Duration) -> Self {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(by))
    }

    /// Shifts backward, saturating at the epoch.
    #[must_use]
    pub fn saturating_sub(self, by: std::time::Duration) -> Self {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(by))
    }

    /// Converts to a `chrono` date-time, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        i64::try_from(self.0)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Day of the week (UTC).
    #[must_use]
    pub fn weekday(self) -> Option<Weekday> {
        self.to_datetime().map(|dt| dt.weekday())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Error returned when a tag string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownTag {
    /// What was being parsed.
    pub kind: &'static str,
    /// The offending text.
    pub value: String,
}

/// Life-area tag of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Personal,
    Household,
    Work,
    Baby,
    Relationship,
    Health,
    Events,
    Maintenance,
    HomeProjects,
}

impl Category {
    /// Every category, in display order.
    pub const ALL: [Self; 9] = [
        Self::Personal,
        Self::Household,
        Self::Work,
        Self::Baby,
        Self::Relationship,
        Self::Health,
        Self::Events,
        Self::Maintenance,
        Self::HomeProjects,
    ];

    /// Stable storage tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Household => "household",
            Self::Work => "work",
            Self::Baby => "baby",
            Self::Relationship => "relationship",
            Self::Health => "health",
            Self::Events => "events",
            Self::Maintenance => "maintenance",
            Self::HomeProjects => "home_projects",
        }
    }
}

impl FromStr for Category {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownTag {
                kind: "category",
                value: s.to_string(),
            })
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Stable storage tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(UnknownTag {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often a recurring task comes back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recurrence {
    Daily,
    /// Monday through Friday.
    Weekdays,
    /// Saturday and Sunday.
    Weekends,
    Weekly(Weekday),
    SpecificDays(Vec<Weekday>),
}

impl Recurrence {
    /// Whether the task recurs on `day`.
    #[must_use]
    pub fn occurs_on(&self, day: Weekday) -> bool {
        match self {
            Self::Daily => true,
            Self::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
            Self::Weekends => matches!(day, Weekday::Sat | Weekday::Sun),
            Self::Weekly(on) => *on == day,
            Self::SpecificDays(days) => days.contains(&day),
        }
    }

    /// Human-readable description, e.g. "Weekdays (Mon-Fri)".
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Daily => "Every day".to_string(),
            Self::Weekdays => "Weekdays (Mon-Fri)".to_string(),
            Self::Weekends => "Weekends (Sat-Sun)".to_string(),
            Self::Weekly(day) => format!("Every {}", day_name(*day)),
            Self::SpecificDays(days) => {
                let names: Vec<_> = days.iter().map(|d| d.to_string()).collect();
                format!("Every {}", names.join(", "))
            }
        }
    }

    /// Compact storage form, e.g. `weekly:Mon` or `days:Mon,Thu`.
    #[must_use]
    pub fn to_tag(&self) -> String {
        match self {
            Self::Daily => "daily".to_string(),
            Self::Weekdays => "weekdays".to_string(),
            Self::Weekends => "weekends".to_string(),
            Self::Weekly(day) => format!("weekly:{day}"),
            Self::SpecificDays(days) => {
                let names: Vec<_> = days.iter().map(ToString::to_string).collect();
                format!("days:{}", names.join(","))
            }
        }
    }
}

impl FromStr for Recurrence {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownTag {
            kind: "recurrence",
            value: s.to_string(),
        };
        match s {
            "daily" => return Ok(Self::Daily),
            "weekdays" => return Ok(Self::Weekdays),
            "weekends" => return Ok(Self::Weekends),
            _ => {}
        }
        if let Some(day) = s.strip_prefix("weekly:") {
            return day.parse().map(Self::Weekly).map_err(|_| unknown());
        }
        if let Some(days) = s.strip_prefix("days:") {
            return days
                .split(',')
                .map(|d| d.parse::<Weekday>().map_err(|_| unknown()))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::SpecificDays);
        }
        Err(unknown())
    }
}

const fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Why a task or patch was refused before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Title is empty after trimming.
    #[error("task title cannot be empty")]
    EmptyTitle,
    /// Title exceeds [`MAX_TITLE_LENGTH`].
    #[error("task title too long: {len} chars (max {max})")]
    TitleTooLong {
        /// Actual length in characters.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },
    /// Detail exceeds [`MAX_DETAIL_LENGTH`].
    #[error("task detail too long: {len} chars (max {max})")]
    DetailTooLong {
        /// Actual length in characters.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },
    /// Subtask edit on a task that has not been made a project.
    #[error("task is not a project")]
    NotAProject,
    /// More than [`MAX_SUBTASKS`] subtasks.
    #[error("too many subtasks: {len} (max {max})")]
    TooManySubtasks {
        /// Actual count.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },
}

/// Checks a title against the length rules.
///
/// # Errors
///
/// Returns `ValidationError::EmptyTitle` or `ValidationError::TitleTooLong`.
pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    let len = trimmed.chars().count();
    if len > MAX_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong {
            len,
            max: MAX_TITLE_LENGTH,
        });
    }
    Ok(())
}

/// Checks an optional detail against the length rule.
///
/// # Errors
///
/// Returns `ValidationError::DetailTooLong`.
pub fn validate_detail(detail: Option<&str>) -> Result<(), ValidationError> {
    let len = detail.map_or(0, |d| d.trim().chars().count());
    if len > MAX_DETAIL_LENGTH {
        return Err(ValidationError::DetailTooLong {
            len,
            max: MAX_DETAIL_LENGTH,
        });
    }
    Ok(())
}

/// User input for a new task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub detail: Option<String>,
    pub category: Option<Category>,
    pub priority: Priority,
    pub recurrence: Option<Recurrence>,
}

impl NewTask {
    /// A new task with only a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Trims text fields and drops an empty detail.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.detail = self
            .detail
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self
    }

    /// Applies the title and detail rules.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ValidationError`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        validate_detail(self.detail.as_deref())
    }
}

/// One step of a project.
///
/// IDs are small integers local to the project, assigned in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subtask {
    pub id: u32,
    pub title: String,
    pub completed_at: Option<Timestamp>,
}

impl Subtask {
    /// An open subtask with a trimmed title.
    #[must_use]
    pub fn new(id: u32, title: &str) -> Self {
        Self {
            id,
            title: title.trim().to_string(),
            completed_at: None,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.completed_at.is_some()
    }

    fn trimmed(&self) -> Self {
        Self {
            title: self.title.trim().to_string(),
            ..self.clone()
        }
    }

    fn to_value(&self) -> FieldValue {
        FieldValue::List(vec![
            FieldValue::Integer(i64::from(self.id)),
            FieldValue::Text(self.title.clone()),
            opt_timestamp(self.completed_at),
        ])
    }

    fn from_value(value: &FieldValue) -> Result<Self, DocumentError> {
        let wrong = || DocumentError::WrongType(fields::SUBTASKS);
        let FieldValue::List(parts) = value else {
            return Err(wrong());
        };
        match parts.as_slice() {
            [FieldValue::Integer(id), FieldValue::Text(title), done] => Ok(Self {
                id: u32::try_from(*id).map_err(|_| wrong())?,
                title: title.clone(),
                completed_at: match done {
                    FieldValue::Null => None,
                    FieldValue::Timestamp(ms) => Some(Timestamp::from_millis(*ms)),
                    _ => return Err(wrong()),
                },
            }),
            _ => Err(wrong()),
        }
    }
}

/// Checks a project's subtask list: count and each title.
///
/// # Errors
///
/// Returns `ValidationError::TooManySubtasks` or the first bad title.
pub fn validate_subtasks(subtasks: &[Subtask]) -> Result<(), ValidationError> {
    if subtasks.len() > MAX_SUBTASKS {
        return Err(ValidationError::TooManySubtasks {
            len: subtasks.len(),
            max: MAX_SUBTASKS,
        });
    }
    subtasks.iter().try_for_each(|s| validate_title(&s.title))
}

/// A task as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub title: String,
    pub detail: Option<String>,
    pub category: Option<Category>,
    pub priority: Priority,
    /// Always equal to `completed_at.is_some()`.
    pub completed: bool,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub snoozed_until: Option<Timestamp>,
    pub recurrence: Option<Recurrence>,
    /// Put away by the user; kept but left out of the working lists.
    pub archived: bool,
    pub is_project: bool,
    pub subtasks: Vec<Subtask>,
    /// Temporary ID the task was created under, if the creating client set one.
    pub client_ref: Option<String>,
}

impl Task {
    /// Builds an incomplete task from user input.
    #[must_use]
    pub fn from_new(id: TaskId, owner: impl Into<String>, new: NewTask, created_at: Timestamp) -> Self {
        let new = new.normalized();
        Self {
            id,
            owner: owner.into(),
            title: new.title,
            detail: new.detail,
            category: new.category,
            priority: new.priority,
            completed: false,
            completed_at: None,
            created_at,
            snoozed_until: None,
            recurrence: new.recurrence,
            archived: false,
            is_project: false,
            subtasks: Vec::new(),
            client_ref: None,
        }
    }

    /// Applies the title and detail rules.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ValidationError`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        validate_detail(self.detail.as_deref())?;
        validate_subtasks(&self.subtasks)
    }

    /// Percentage of subtasks done, rounded; 0 without subtasks.
    #[must_use]
    pub fn progress(&self) -> u8 {
        let total = self.subtasks.len();
        if total == 0 {
            return 0;
        }
        let done = self.subtasks.iter().filter(|s| s.is_done()).count();
        u8::try_from((done * 200 + total) / (total * 2)).unwrap_or(100)
    }

    /// Next free subtask ID.
    #[must_use]
    pub fn next_subtask_id(&self) -> u32 {
        self.subtasks.iter().map(|s| s.id).max().map_or(1, |id| id.saturating_add(1))
    }

    /// Whether the task is hidden by a snooze at `now`.
    #[must_use]
    pub fn is_snoozed(&self, now: Timestamp) -> bool {
        self.snoozed_until.is_some_and(|until| until > now)
    }

    /// Encodes the task as document fields (the ID is not a field).
    #[must_use]
    pub fn to_fields(&self) -> Fields {
        let mut out = Fields::new();
        out.insert(fields::OWNER.into(), FieldValue::Text(self.owner.clone()));
        out.insert(fields::TITLE.into(), FieldValue::Text(self.title.clone()));
        out.insert(fields::DETAIL.into(), opt_text(self.detail.as_deref()));
        out.insert(
            fields::CATEGORY.into(),
            opt_text(self.category.map(Category::as_str)),
        );
        out.insert(
            fields::PRIORITY.into(),
            FieldValue::Text(self.priority.as_str().into()),
        );
        out.insert(fields::COMPLETED.into(), FieldValue::Bool(self.completed));
        out.insert(fields::COMPLETED_AT.into(), opt_timestamp(self.completed_at));
        out.insert(
            fields::CREATED_AT.into(),
            FieldValue::Timestamp(self.created_at.as_millis()),
        );
        out.insert(fields::SNOOZED_UNTIL.into(), opt_timestamp(self.snoozed_until));
        out.insert(
            fields::RECURRENCE.into(),
            self.recurrence
                .as_ref()
                .map_or(FieldValue::Null, |r| FieldValue::Text(r.to_tag())),
        );
        out.insert(fields::ARCHIVED.into(), FieldValue::Bool(self.archived));
        out.insert(fields::IS_PROJECT.into(), FieldValue::Bool(self.is_project));
        out.insert(fields::SUBTASKS.into(), subtasks_value(&self.subtasks));
        out.insert(fields::CLIENT_REF.into(), opt_text(self.client_ref.as_deref()));
        out
    }

    /// Decodes a task document.
    ///
    /// # Errors
    ///
    /// Returns a [`DocumentError`] for a missing or malformed field.
    pub fn from_document(doc: &Document) -> Result<Self, DocumentError> {
        let f = &doc.fields;
        let completed_at = read_opt_timestamp(f, fields::COMPLETED_AT)?;
        Ok(Self {
            id: TaskId::persisted(doc.id.clone()),
            owner: read_text(f, fields::OWNER)?,
            title: read_text(f, fields::TITLE)?,
            detail: read_opt_text(f, fields::DETAIL)?,
            category: read_opt_text(f, fields::CATEGORY)?
                .map(|c| parse_tag(fields::CATEGORY, &c))
                .transpose()?,
            priority: read_opt_text(f, fields::PRIORITY)?
                .map(|p| parse_tag(fields::PRIORITY, &p))
                .transpose()?
                .unwrap_or_default(),
            completed: completed_at.is_some(),
            completed_at,
            created_at: read_opt_timestamp(f, fields::CREATED_AT)?
                .ok_or(DocumentError::MissingField(fields::CREATED_AT))?,
            snoozed_until: read_opt_timestamp(f, fields::SNOOZED_UNTIL)?,
            recurrence: read_opt_text(f, fields::RECURRENCE)?
                .map(|r| parse_tag(fields::RECURRENCE, &r))
                .transpose()?,
            archived: read_flag(f, fields::ARCHIVED)?,
            is_project: read_flag(f, fields::IS_PROJECT)?,
            subtasks: read_subtasks(f)?,
            client_ref: read_opt_text(f, fields::CLIENT_REF)?,
        })
    }
}

/// Whether a task document has been soft-deleted.
#[must_use]
pub fn is_tombstone(doc_fields: &Fields) -> bool {
    field(doc_fields, fields::DELETED).as_bool() == Some(true)
}

/// A partial update of a task's user-editable fields.
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(clippy::option_option)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub detail: Option<Option<String>>,
    pub category: Option<Option<Category>>,
    pub priority: Option<Priority>,
    pub snoozed_until: Option<Option<Timestamp>>,
    pub recurrence: Option<Option<Recurrence>>,
    pub archived: Option<bool>,
    pub is_project: Option<bool>,
    /// Replaces the whole subtask list.
    pub subtasks: Option<Vec<Subtask>>,
}

impl TaskPatch {
    /// A patch that only renames.
    #[must_use]
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// A patch that sets or clears the snooze.
    #[must_use]
    pub fn snooze(until: Option<Timestamp>) -> Self {
        Self {
            snoozed_until: Some(until),
            ..Self::default()
        }
    }

    /// A patch that archives or unarchives.
    #[must_use]
    pub fn archive(archived: bool) -> Self {
        Self {
            archived: Some(archived),
            ..Self::default()
        }
    }

    /// A patch that marks the task a project with these subtasks.
    #[must_use]
    pub fn project(subtasks: Vec<Subtask>) -> Self {
        Self {
            is_project: Some(true),
            subtasks: Some(subtasks),
            ..Self::default()
        }
    }

    /// A patch that replaces the subtask list.
    #[must_use]
    pub fn subtasks(subtasks: Vec<Subtask>) -> Self {
        Self {
            subtasks: Some(subtasks),
            ..Self::default()
        }
    }

    /// Returns `true` when the patch touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the title and detail rules to the touched fields.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ValidationError`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(detail) = &self.detail {
            validate_detail(detail.as_deref())?;
        }
        if let Some(subtasks) = &self.subtasks {
            validate_subtasks(subtasks)?;
        }
        Ok(())
    }

    /// Merges the patch into a task, trimming text fields.
    pub fn apply(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.trim().to_string();
        }
        if let Some(detail) = &self.detail {
            task.detail = detail
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string);
        }
        if let Some(category) = self.category {
            task.category = category;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(until) = self.snoozed_until {
            task.snoozed_until = until;
        }
        if let Some(recurrence) = &self.recurrence {
            task.recurrence.clone_from(recurrence);
        }
        if let Some(archived) = self.archived {
            task.archived = archived;
        }
        if let Some(is_project) = self.is_project {
            task.is_project = is_project;
        }
        if let Some(subtasks) = &self.subtasks {
            task.subtasks = subtasks.iter().map(Subtask::trimmed).collect();
        }
    }

    /// A patch that, applied after this one, restores `before`'s values for
    /// exactly the fields this patch touches.
    #[must_use]
    pub fn inverse_for(&self, before: &Task) -> Self {
        Self {
            title: self.title.as_ref().map(|_| before.title.clone()),
            detail: self.detail.as_ref().map(|_| before.detail.clone()),
            category: self.category.map(|_| before.category),
            priority: self.priority.map(|_| before.priority),
            snoozed_until: self.snoozed_until.map(|_| before.snoozed_until),
            recurrence: self.recurrence.as_ref().map(|_| before.recurrence.clone()),
            archived: self.archived.map(|_| before.archived),
            is_project: self.is_project.map(|_| before.is_project),
            subtasks: self.subtasks.as_ref().map(|_| before.subtasks.clone()),
        }
    }

    /// Encodes the touched fields as a document patch.
    #[must_use]
    pub fn to_fields(&self) -> Fields {
        let mut out = Fields::new();
        if let Some(title) = &self.title {
            out.insert(fields::TITLE.into(), FieldValue::Text(title.trim().into()));
        }
        if let Some(detail) = &self.detail {
            let detail = detail.as_deref().map(str::trim).filter(|d| !d.is_empty());
            out.insert(fields::DETAIL.into(), opt_text(detail));
        }
        if let Some(category) = self.category {
            out.insert(
                fields::CATEGORY.into(),
                opt_text(category.map(Category::as_str)),
            );
        }
        if let Some(priority) = self.priority {
            out.insert(
                fields::PRIORITY.into(),
                FieldValue::Text(priority.as_str().into()),
            );
        }
        if let Some(until) = self.snoozed_until {
            out.insert(fields::SNOOZED_UNTIL.into(), opt_timestamp(until));
        }
        if let Some(recurrence) = &self.recurrence {
            out.insert(
                fields::RECURRENCE.into(),
                recurrence
                    .as_ref()
                    .map_or(FieldValue::Null, |r| FieldValue::Text(r.to_tag())),
            );
        }
        if let Some(archived) = self.archived {
            out.insert(fields::ARCHIVED.into(), FieldValue::Bool(archived));
        }
        if let Some(is_project) = self.is_project {
            out.insert(fields::IS_PROJECT.into(), FieldValue::Bool(is_project));
        }
        if let Some(subtasks) = &self.subtasks {
            let trimmed: Vec<Subtask> = subtasks.iter().map(Subtask::trimmed).collect();
            out.insert(fields::SUBTASKS.into(), subtasks_value(&trimmed));
        }
        out
    }
}

/// Why a document could not be read as a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// A required field is absent or null.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// A field holds a value of the wrong kind.
    #[error("field {0} has the wrong type")]
    WrongType(&'static str),
    /// A tag field holds an unknown value.
    #[error("field {field}: {source}")]
    InvalidValue {
        /// The field.
        field: &'static str,
        /// Parse failure.
        source: UnknownTag,
    },
}

fn opt_text(value: Option<&str>) -> FieldValue {
    value.map_or(FieldValue::Null, |v| FieldValue::Text(v.to_string()))
}

fn opt_timestamp(value: Option<Timestamp>) -> FieldValue {
    value.map_or(FieldValue::Null, |t| FieldValue::Timestamp(t.as_millis()))
}

fn subtasks_value(subtasks: &[Subtask]) -> FieldValue {
    FieldValue::List(subtasks.iter().map(Subtask::to_value).collect())
}

/// Missing or null reads as `false`.
fn read_flag(f: &Fields, name: &'static str) -> Result<bool, DocumentError> {
    match field(f, name) {
        FieldValue::Null => Ok(false),
        FieldValue::Bool(b) => Ok(*b),
        _ => Err(DocumentError::WrongType(name)),
    }
}

fn read_subtasks(f: &Fields) -> Result<Vec<Subtask>, DocumentError> {
    match field(f, fields::SUBTASKS) {
        FieldValue::Null => Ok(Vec::new()),
        FieldValue::List(items) => items.iter().map(Subtask::from_value).collect(),
        _ => Err(DocumentError::WrongType(fields::SUBTASKS)),
    }
}

fn read_text(f: &Fields, name: &'static str) -> Result<String, DocumentError> {
    read_opt_text(f, name)?.ok_or(DocumentError::MissingField(name))
}

fn read_opt_text(f: &Fields, name: &'static str) -> Result<Option<String>, DocumentError> {
    match field(f, name) {
        FieldValue::Null => Ok(None),
        FieldValue::Text(s) => Ok(Some(s.clone())),
        _ => Err(DocumentError::WrongType(name)),
    }
}

fn read_opt_timestamp(f: &Fields, name: &'static str) -> Result<Option<Timestamp>, DocumentError> {
    match field(f, name) {
        FieldValue::Null => Ok(None),
        FieldValue::Timestamp(ms) => Ok(Some(Timestamp::from_millis(*ms))),
        _ => Err(DocumentError::WrongType(name)),
    }
}

fn parse_tag<T>(name: &'static str, text: &str) -> Result<T, DocumentError>
where
    T: FromStr<Err = UnknownTag>,
{
    text.parse()
        .map_err(|source| DocumentError::InvalidValue { field: name, source })
}
