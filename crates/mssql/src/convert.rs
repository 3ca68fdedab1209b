//! Conversions between TDS column data and the engine's rows and keys.

use anyhow::{bail, Result};
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{json, Map, Value};
use tiberius::{ColumnData, FromSql, Row};
use trigger_core::{ChangeRow, KeyValue, PrimaryKey, TrackedChange, WatchedTable};

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// JSON rendering of a single column value.
///
/// Exact numerics become JSON numbers when they fit, binary data is base64
/// and temporal types use ISO 8601 text.
pub(crate) fn column_to_json(data: &ColumnData<'static>) -> Result<Value> {
    let value = match data {
        ColumnData::U8(v) => json!(v),
        ColumnData::I16(v) => json!(v),
        ColumnData::I32(v) => json!(v),
        ColumnData::I64(v) => json!(v),
        ColumnData::F32(v) => json!(v),
        ColumnData::F64(v) => json!(v),
        ColumnData::Bit(v) => json!(v),
        ColumnData::String(v) => json!(v.as_deref()),
        ColumnData::Guid(v) => json!(v.map(|u| u.to_string())),
        ColumnData::Binary(v) => match v {
            Some(bytes) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => Value::Null,
        },
        ColumnData::Numeric(v) => match v {
            Some(n) => decimal_json(&n.to_string()),
            None => Value::Null,
        },
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            match NaiveDateTime::from_sql(data)? {
                Some(dt) => Value::String(dt.format(DATETIME_FORMAT).to_string()),
                None => Value::Null,
            }
        }
        ColumnData::Date(_) => match NaiveDate::from_sql(data)? {
            Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            None => Value::Null,
        },
        ColumnData::Time(_) => match NaiveTime::from_sql(data)? {
            Some(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            None => Value::Null,
        },
        ColumnData::DateTimeOffset(_) => match DateTime::<FixedOffset>::from_sql(data)? {
            Some(dt) => Value::String(dt.to_rfc3339()),
            None => Value::Null,
        },
        other => bail!("Unsupported column data: {other:?}"),
    };
    Ok(value)
}

fn decimal_json(text: &str) -> Value {
    serde_json::from_str::<serde_json::Number>(text)
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Typed key value of a primary key column. `None` for NULL.
pub(crate) fn column_to_key(data: &ColumnData<'static>) -> Result<Option<KeyValue>> {
    let key = match data {
        ColumnData::U8(v) => v.map(|i| KeyValue::Int(i.into())),
        ColumnData::I16(v) => v.map(|i| KeyValue::Int(i.into())),
        ColumnData::I32(v) => v.map(|i| KeyValue::Int(i.into())),
        ColumnData::I64(v) => v.map(KeyValue::Int),
        ColumnData::Bit(v) => v.map(KeyValue::Bool),
        ColumnData::String(v) => v.as_deref().map(|s| KeyValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(KeyValue::Uuid),
        ColumnData::Binary(v) => v.as_deref().map(|b| KeyValue::Bytes(b.to_vec())),
        ColumnData::Numeric(v) => v.as_ref().map(|n| KeyValue::Decimal(n.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(KeyValue::DateTime)
        }
        // Remaining key types round-trip through their JSON text.
        other => match column_to_json(other)? {
            Value::Null => None,
            Value::String(s) => Some(KeyValue::Text(s)),
            value => KeyValue::from_json(&value),
        },
    };
    Ok(key)
}

/// Convert a full table row.
pub(crate) fn row_to_change_row(row: Row) -> Result<ChangeRow> {
    let names: Vec<String> = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let mut out = ChangeRow::new();
    for (name, data) in names.into_iter().zip(row) {
        let value = column_to_json(&data)?;
        out.insert(name, value);
    }
    Ok(out)
}

/// Read the primary key columns of a row by name.
pub(crate) fn row_key(row: &Row, table: &WatchedTable) -> Result<PrimaryKey> {
    let mut values = Vec::with_capacity(table.primary_keys.len());
    for name in table.primary_key_names() {
        let index = column_index(row, name)?;
        let data = row
            .cells()
            .nth(index)
            .map(|(_, data)| data)
            .ok_or_else(|| anyhow::anyhow!("Row has no cell for key column '{name}'"))?;
        match column_to_key(data)? {
            Some(value) => values.push(value),
            None => bail!("Primary key column '{name}' is NULL"),
        }
    }
    Ok(PrimaryKey::new(values))
}

fn column_index(row: &Row, name: &str) -> Result<usize> {
    row.columns()
        .iter()
        .position(|c| c.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow::anyhow!("Result is missing column '{name}'"))
}

/// Whether the row carries the named column.
pub(crate) fn has_column(row: &Row, name: &str) -> bool {
    row.columns()
        .iter()
        .any(|c| c.name().eq_ignore_ascii_case(name))
}

/// JSON array of key objects, optionally carrying each change's version,
/// for binding as an `OPENJSON` parameter.
pub(crate) fn keys_json<'a>(
    table: &WatchedTable,
    keys: impl IntoIterator<Item = (&'a PrimaryKey, Option<i64>)>,
) -> String {
    let entries: Vec<Value> = keys
        .into_iter()
        .map(|(key, version)| {
            let mut object = Map::new();
            for (name, value) in table.primary_key_names().zip(key.values()) {
                object.insert(name.to_string(), value.to_json());
            }
            if let Some(version) = version {
                object.insert(crate::sql::VERSION_FIELD.to_string(), Value::from(version));
            }
            Value::Object(object)
        })
        .collect();
    Value::Array(entries).to_string()
}

/// JSON parameter for lease updates that need each change's version.
pub(crate) fn changes_json<'a>(
    table: &WatchedTable,
    changes: impl IntoIterator<Item = &'a TrackedChange>,
) -> String {
    keys_json(
        table,
        changes.into_iter().map(|c| (&c.key, Some(c.version))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use trigger_core::{ColumnDefinition, SqlObject};

    fn table() -> WatchedTable {
        WatchedTable {
            object: SqlObject::new("dbo", "Orders"),
            object_id: 7,
            primary_keys: vec![
                ColumnDefinition::new("Region", "nvarchar(10)"),
                ColumnDefinition::new("OrderId", "int"),
            ],
            columns: vec![],
        }
    }

    #[test]
    fn test_scalar_columns_to_json() {
        assert_eq!(column_to_json(&ColumnData::I32(Some(5))).unwrap(), json!(5));
        assert_eq!(column_to_json(&ColumnData::I64(None)).unwrap(), Value::Null);
        assert_eq!(
            column_to_json(&ColumnData::Bit(Some(true))).unwrap(),
            json!(true)
        );
        assert_eq!(
            column_to_json(&ColumnData::String(Some(Cow::Borrowed("abc")))).unwrap(),
            json!("abc")
        );
        assert_eq!(
            column_to_json(&ColumnData::Binary(Some(Cow::Owned(vec![1, 2, 3])))).unwrap(),
            json!("AQID")
        );
    }

    #[test]
    fn test_key_values_keep_their_type() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            column_to_key(&ColumnData::Guid(Some(id))).unwrap(),
            Some(KeyValue::Uuid(id))
        );
        assert_eq!(
            column_to_key(&ColumnData::I16(Some(3))).unwrap(),
            Some(KeyValue::Int(3))
        );
        assert_eq!(column_to_key(&ColumnData::I32(None)).unwrap(), None);
    }

    #[test]
    fn test_keys_json_orders_by_key_columns() {
        let key = PrimaryKey::new(vec![KeyValue::from("eu"), KeyValue::Int(42)]);
        let json: Value = serde_json::from_str(&keys_json(&table(), [(&key, Some(9))])).unwrap();
        assert_eq!(
            json,
            json!([{"Region": "eu", "OrderId": 42, "SYS_CHANGE_VERSION": 9}])
        );

        let json: Value = serde_json::from_str(&keys_json(&table(), [(&key, None)])).unwrap();
        assert_eq!(json, json!([{"Region": "eu", "OrderId": 42}]));
    }
}
