//! Document model shared by the store server and its clients.
//!
//! A document is a flat map of named, typed field values inside a named
//! collection. Queries and live subscriptions select documents with simple
//! field filters; mutations are reported to subscribers as [`ChangeBatch`]es.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single typed field value.
///
/// Floats are deliberately absent so values stay totally ordered and
/// comparable across the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit absence; also what a missing field reads as.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Milliseconds since the UNIX epoch.
    Timestamp(u64),
    /// Ordered list of values.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Returns the boolean if this is a `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the text if this is a `Text`.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the millisecond value if this is a `Timestamp`.
    #[must_use]
    pub const fn as_timestamp(&self) -> Option<u64> {
        match self {
            Self::Timestamp(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Returns `true` for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Compares two values of the same kind. Values of different kinds are
    /// unordered.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::List(a), Self::List(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Named field values of one document.
pub type Fields = BTreeMap<String, FieldValue>;

const NULL: FieldValue = FieldValue::Null;

/// Reads a field, treating a missing key as [`FieldValue::Null`].
#[must_use]
pub fn field<'a>(fields: &'a Fields, name: &str) -> &'a FieldValue {
    fields.get(name).unwrap_or(&NULL)
}

/// Writes every entry of `patch` into `fields`.
pub fn merge_patch(fields: &mut Fields, patch: &Fields) {
    for (name, value) in patch {
        fields.insert(name.clone(), value.clone());
    }
}

/// A stored document: server-assigned ID plus its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Server-assigned identifier, unique within the collection.
    pub id: String,
    /// Field values.
    pub fields: Fields,
}

impl Document {
    /// Creates a document from an ID and its fields.
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Reads a field, treating a missing key as `Null`.
    #[must_use]
    pub fn get(&self, name: &str) -> &FieldValue {
        field(&self.fields, name)
    }
}

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Field equals value.
    Eq,
    /// Field differs from value.
    Ne,
    /// Field is less than value.
    Lt,
    /// Field is less than or equal to value.
    Le,
    /// Field is greater than value.
    Gt,
    /// Field is greater than or equal to value.
    Ge,
}

/// A predicate on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Field name.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Right-hand side of the comparison.
    pub value: FieldValue,
}

impl Filter {
    /// Builds a filter.
    #[must_use]
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Shorthand for an equality filter.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Evaluates the filter against a document's fields.
    ///
    /// Ordering operators never match values of a different kind.
    #[must_use]
    pub fn matches(&self, fields: &Fields) -> bool {
        let actual = field(fields, &self.field);
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => actual.compare(&self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                actual.compare(&self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => actual.compare(&self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                actual.compare(&self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Returns `true` when every filter matches.
#[must_use]
pub fn matches_all(filters: &[Filter], fields: &Fields) -> bool {
    filters.iter().all(|f| f.matches(fields))
}

/// Sort direction of an [`OrderBy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Sort key of a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to sort on.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

/// A one-shot selection over a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// All filters must match.
    pub filters: Vec<Filter>,
    /// Optional sort key; ties and unsorted results fall back to document ID.
    pub order_by: Option<OrderBy>,
    /// Maximum number of documents returned.
    pub limit: Option<u32>,
}

impl Query {
    /// An empty query selecting every document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the sort key.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Caps the result size.
    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Runs the query over a set of documents.
    #[must_use]
    pub fn select<'a, I>(&self, documents: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut selected: Vec<Document> = documents
            .into_iter()
            .filter(|doc| matches_all(&self.filters, &doc.fields))
            .cloned()
            .collect();

        selected.sort_by(|a, b| {
            let by_field = self.order_by.as_ref().map_or(Ordering::Equal, |order| {
                let ord = a.get(&order.field).cmp(b.get(&order.field));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
            by_field.then_with(|| a.id.cmp(&b.id))
        });

        if let Some(limit) = self.limit {
            selected.truncate(limit as usize);
        }
        selected
    }
}

/// One document-level change delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// The document was created or modified and matches the subscription.
    Upserted(Document),
    /// The document was deleted or no longer matches the subscription.
    Removed {
        /// ID of the removed document.
        id: String,
    },
}

impl Change {
    /// ID of the document this change concerns.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Upserted(doc) => &doc.id,
            Self::Removed { id } => id,
        }
    }
}

/// Changes delivered together, in the order they happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// The changes.
    pub changes: Vec<Change>,
}

/// Computes what a subscriber with `filters` should see when a document
/// moves from `before` to `after` (`None` meaning absent).
#[must_use]
pub fn change_for(
    id: &str,
    before: Option<&Fields>,
    after: Option<&Fields>,
    filters: &[Filter],
) -> Option<Change> {
    let was_visible = before.is_some_and(|f| matches_all(filters, f));
    match after {
        Some(fields) if matches_all(filters, fields) => Some(Change::Upserted(Document::new(
            id,
            fields.clone(),
        ))),
        _ if was_visible => Some(Change::Removed { id: id.to_string() }),
        _ => None,
    }
}
