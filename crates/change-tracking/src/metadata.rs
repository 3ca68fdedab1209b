//! Table metadata resolution and validation.

use tracing::debug;
use trigger_core::{ConfigurationError, Result, SqlObject, WatchedTable};

use crate::store::TableCatalog;

/// Resolve `object` into a validated [`WatchedTable`].
///
/// Checks run in a fixed order and the first violation is returned: existence,
/// change tracking, primary key presence, reserved key names, column types.
pub async fn resolve_table<C>(catalog: &C, object: &SqlObject) -> Result<WatchedTable>
where
    C: TableCatalog + ?Sized,
{
    let table = object.to_string();

    let object_id = catalog
        .table_id(object)
        .await?
        .ok_or_else(|| ConfigurationError::TableNotFound {
            table: table.clone(),
        })?;

    if catalog
        .change_tracking_min_valid_version(object_id)
        .await?
        .is_none()
    {
        return Err(ConfigurationError::ChangeTrackingDisabled { table }.into());
    }

    let primary_keys = catalog.primary_key_columns(object_id).await?;
    if primary_keys.is_empty() {
        return Err(ConfigurationError::NoPrimaryKey { table }.into());
    }

    for column in &primary_keys {
        if let Some(reserved) = column.reserved_collision() {
            return Err(ConfigurationError::ReservedColumnName {
                table,
                column: column.name.clone(),
                reserved: reserved.to_string(),
            }
            .into());
        }
    }

    let columns = catalog.columns(object_id).await?;
    if let Some(column) = columns.iter().find(|c| c.is_unsupported()) {
        return Err(ConfigurationError::UnsupportedColumnType {
            table,
            column: column.name.clone(),
            sql_type: column.sql_type.clone(),
        }
        .into());
    }

    debug!(
        "Resolved table {} (id {object_id}) with primary keys {:?}",
        object,
        primary_keys.iter().map(|c| &c.name).collect::<Vec<_>>()
    );

    Ok(WatchedTable {
        object: object.clone(),
        object_id,
        primary_keys,
        columns,
    })
}
