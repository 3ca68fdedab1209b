//! Row to user type mapping.
//!
//! Rows are carried as JSON objects keyed by column name and mapped onto the
//! user's type with serde. Delete changes only carry primary key columns, so
//! user types should make their non-key fields optional or defaulted.

use serde::de::DeserializeOwned;

use crate::change::{ChangeRow, SqlChange, SqlChangeOperation, TrackedChange};
use crate::error::{Result, TriggerError};
use crate::table::WatchedTable;

/// Maps fetched rows and leased changes of one table onto `SqlChange<T>`.
#[derive(Debug, Clone)]
pub struct RowMapper<'a> {
    table: &'a WatchedTable,
}

impl<'a> RowMapper<'a> {
    pub fn new(table: &'a WatchedTable) -> Self {
        Self { table }
    }

    /// Row holding only the primary key of `change`.
    pub fn key_row(&self, change: &TrackedChange) -> ChangeRow {
        change.key.to_row(self.table)
    }

    pub fn map<T: DeserializeOwned>(&self, row: &ChangeRow) -> Result<T> {
        serde_json::from_value(row.to_json()).map_err(|e| TriggerError::RowMapping {
            table: self.table.object.to_string(),
            reason: e.to_string(),
        })
    }

    /// Build the delivered change.
    ///
    /// An insert or update whose row is gone by fetch time is reported as a
    /// delete carrying the primary key only.
    pub fn to_change<T: DeserializeOwned>(
        &self,
        change: &TrackedChange,
        row: Option<&ChangeRow>,
    ) -> Result<SqlChange<T>> {
        match (change.operation, row) {
            (SqlChangeOperation::Delete, _) | (_, None) => Ok(SqlChange::new(
                SqlChangeOperation::Delete,
                self.map(&self.key_row(change))?,
            )),
            (operation, Some(row)) => Ok(SqlChange::new(operation, self.map(row)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::PrimaryKey;
    use crate::table::{ColumnDefinition, SqlObject};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct Product {
        product_id: i64,
        name: Option<String>,
        #[serde(default)]
        cost: f64,
    }

    fn products() -> WatchedTable {
        WatchedTable {
            object: SqlObject::new("dbo", "Products"),
            object_id: 11,
            primary_keys: vec![ColumnDefinition::new("ProductId", "int")],
            columns: vec![
                ColumnDefinition::new("ProductId", "int"),
                ColumnDefinition::new("Name", "nvarchar(100)"),
                ColumnDefinition::new("Cost", "float"),
            ],
        }
    }

    fn tracked(op: SqlChangeOperation) -> TrackedChange {
        TrackedChange {
            key: PrimaryKey::single(3i64),
            version: 10,
            operation: op,
            attempt_count: 1,
        }
    }

    fn product_row() -> ChangeRow {
        let mut row = ChangeRow::new();
        row.insert("ProductId", json!(3));
        row.insert("Name", json!("Widget"));
        row.insert("Cost", json!(2.5));
        row
    }

    #[test]
    fn test_update_maps_full_row() {
        let table = products();
        let mapper = RowMapper::new(&table);
        let change: SqlChange<Product> = mapper
            .to_change(&tracked(SqlChangeOperation::Update), Some(&product_row()))
            .unwrap();
        assert_eq!(change.operation, SqlChangeOperation::Update);
        assert_eq!(
            change.item,
            Product {
                product_id: 3,
                name: Some("Widget".into()),
                cost: 2.5
            }
        );
    }

    #[test]
    fn test_delete_carries_key_only() {
        let table = products();
        let mapper = RowMapper::new(&table);
        let change: SqlChange<Product> = mapper
            .to_change(&tracked(SqlChangeOperation::Delete), Some(&product_row()))
            .unwrap();
        assert_eq!(change.operation, SqlChangeOperation::Delete);
        assert_eq!(change.item.product_id, 3);
        assert_eq!(change.item.name, None);
    }

    #[test]
    fn test_missing_row_becomes_delete() {
        let table = products();
        let mapper = RowMapper::new(&table);
        let change: SqlChange<serde_json::Value> = mapper
            .to_change(&tracked(SqlChangeOperation::Insert), None)
            .unwrap();
        assert_eq!(change.operation, SqlChangeOperation::Delete);
        assert_eq!(change.item, json!({"ProductId": 3}));
    }

    #[test]
    fn test_mapping_failure_names_table() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Strict {
            missing: String,
        }
        let table = products();
        let mapper = RowMapper::new(&table);
        let err = mapper.map::<Strict>(&product_row()).unwrap_err();
        assert!(matches!(err, TriggerError::RowMapping { ref table, .. } if table == "dbo.Products"));
    }
}
