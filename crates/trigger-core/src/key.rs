//! Typed primary key values.
//!
//! Leases are keyed by the watched table's primary key tuple. Values carry
//! enough type information to order and hash them in memory and to render
//! them back to JSON for row lookups and delete payloads.

use base64::Engine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::change::ChangeRow;
use crate::table::WatchedTable;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A single primary key column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    /// Exact numeric kept as its decimal text to avoid float rounding.
    Decimal(String),
}

impl KeyValue {
    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Text(s) => Value::String(s.clone()),
            KeyValue::Bytes(b) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            KeyValue::Uuid(u) => Value::String(u.to_string()),
            KeyValue::DateTime(dt) => Value::String(dt.format(DATETIME_FORMAT).to_string()),
            KeyValue::Decimal(d) => serde_json::from_str::<serde_json::Number>(d)
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(d.clone())),
        }
    }

    /// Best-effort conversion of an untyped JSON value.
    ///
    /// Integers become `Int`, other numbers `Decimal`, strings `Text`.
    /// Nulls, arrays and objects cannot be key values.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(KeyValue::Int(i)),
                None => Some(KeyValue::Decimal(n.to_string())),
            },
            Value::String(s) => Some(KeyValue::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Text(s) => write!(f, "'{s}'"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(value.into())
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        KeyValue::Uuid(value)
    }
}

/// Primary key tuple, ordered like the table's key columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<KeyValue>);

impl PrimaryKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<KeyValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    /// Extract the key from a row using the table's key columns.
    pub fn from_row(row: &ChangeRow, table: &WatchedTable) -> Option<Self> {
        table
            .primary_key_names()
            .map(|name| row.get(name).and_then(KeyValue::from_json))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Render as a row containing only the key columns.
    pub fn to_row(&self, table: &WatchedTable) -> ChangeRow {
        let mut row = ChangeRow::new();
        for (name, value) in table.primary_key_names().zip(&self.0) {
            row.insert(name, value.to_json());
        }
        row
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnDefinition, SqlObject};
    use serde_json::json;

    fn orders_table() -> WatchedTable {
        WatchedTable {
            object: SqlObject::new("dbo", "Orders"),
            object_id: 7,
            primary_keys: vec![
                ColumnDefinition::new("Region", "nvarchar(10)"),
                ColumnDefinition::new("OrderId", "int"),
            ],
            columns: vec![
                ColumnDefinition::new("Region", "nvarchar(10)"),
                ColumnDefinition::new("OrderId", "int"),
                ColumnDefinition::new("Total", "decimal(10,2)"),
            ],
        }
    }

    #[test]
    fn test_key_from_row_follows_key_order() {
        let mut row = ChangeRow::new();
        row.insert("Total", json!(12.5));
        row.insert("OrderId", json!(42));
        row.insert("Region", json!("eu"));

        let key = PrimaryKey::from_row(&row, &orders_table()).unwrap();
        assert_eq!(key, PrimaryKey::new(vec!["eu".into(), 42i64.into()]));
        assert_eq!(key.to_string(), "('eu', 42)");
    }

    #[test]
    fn test_key_from_row_missing_column() {
        let mut row = ChangeRow::new();
        row.insert("OrderId", json!(42));
        assert!(PrimaryKey::from_row(&row, &orders_table()).is_none());
    }

    #[test]
    fn test_key_to_row_contains_only_keys() {
        let key = PrimaryKey::new(vec!["us".into(), 1i64.into()]);
        let row = key.to_row(&orders_table());
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("Region"), Some(&json!("us")));
        assert_eq!(row.get("OrderId"), Some(&json!(1)));
        assert_eq!(row.get("Total"), None);
    }

    #[test]
    fn test_value_json_rendering() {
        assert_eq!(KeyValue::Bytes(vec![1, 2, 3]).to_json(), json!("AQID"));
        assert_eq!(KeyValue::Decimal("10.25".into()).to_json(), json!(10.25));
        assert_eq!(KeyValue::Decimal("n/a".into()).to_json(), json!("n/a"));
        let dt = NaiveDateTime::parse_from_str("2024-01-02 03:04:05", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        assert_eq!(KeyValue::DateTime(dt).to_json(), json!("2024-01-02T03:04:05"));
    }

    #[test]
    fn test_keys_order_for_map_use() {
        let mut keys = vec![
            PrimaryKey::single(3i64),
            PrimaryKey::single(1i64),
            PrimaryKey::single(2i64),
        ];
        keys.sort();
        assert_eq!(keys[0], PrimaryKey::single(1i64));
        assert_eq!(keys[2], PrimaryKey::single(3i64));
    }
}
