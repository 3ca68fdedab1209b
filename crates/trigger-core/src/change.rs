//! Change records produced by polling and delivered to user functions.

use crate::key::PrimaryKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of row change reported by change tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlChangeOperation {
    Insert,
    Update,
    Delete,
}

impl SqlChangeOperation {
    /// Map a `SYS_CHANGE_OPERATION` code (`I`, `U`, `D`).
    pub fn from_change_tracking_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

/// A row as an ordered list of column name and JSON value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeRow {
    columns: Vec<(String, Value)>,
}

impl ChangeRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a column, keeping first-insertion order.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.columns.push((column, value)),
        }
    }

    /// Case-insensitive column lookup, matching SQL Server's default collation.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .columns
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Value::Object(map)
    }
}

impl FromIterator<(String, Value)> for ChangeRow {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = ChangeRow::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

/// A leased change: key, version, operation and dispatch attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedChange {
    pub key: PrimaryKey,
    pub version: i64,
    pub operation: SqlChangeOperation,
    pub attempt_count: i32,
}

/// Changes leased in one poll tick, ordered by ascending change version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    changes: Vec<TrackedChange>,
}

impl ChangeBatch {
    pub fn new(mut changes: Vec<TrackedChange>) -> Self {
        changes.sort_by_key(|c| c.version);
        Self { changes }
    }

    pub fn changes(&self) -> &[TrackedChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrackedChange> {
        self.changes.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PrimaryKey> {
        self.changes.iter().map(|c| &c.key)
    }

    pub fn max_version(&self) -> Option<i64> {
        self.changes.last().map(|c| c.version)
    }

    /// Version the global cursor may move to once this batch is released.
    ///
    /// The highest version can be shared with changes that did not fit in the
    /// batch, so the second-highest distinct version is used. A batch with a
    /// single distinct version returns that version.
    pub fn cursor_candidate(&self) -> Option<i64> {
        let mut versions: Vec<i64> = self.changes.iter().map(|c| c.version).collect();
        versions.dedup();
        match versions.len() {
            0 => None,
            1 => Some(versions[0]),
            n => Some(versions[n - 2]),
        }
    }

    /// Split into deliveries of at most `size` changes.
    pub fn chunks(&self, size: usize) -> std::slice::Chunks<'_, TrackedChange> {
        self.changes.chunks(size.max(1))
    }

    /// Highest attempt count in the batch, for logging redeliveries.
    pub fn max_attempt_count(&self) -> i32 {
        self.changes
            .iter()
            .map(|c| c.attempt_count)
            .max()
            .unwrap_or(0)
    }
}

impl IntoIterator for ChangeBatch {
    type Item = TrackedChange;
    type IntoIter = std::vec::IntoIter<TrackedChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

/// A change delivered to a user function.
///
/// For deletes only the primary key fields of `item` are populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlChange<T> {
    pub operation: SqlChangeOperation,
    pub item: T,
}

impl<T> SqlChange<T> {
    pub fn new(operation: SqlChangeOperation, item: T) -> Self {
        Self { operation, item }
    }
}
