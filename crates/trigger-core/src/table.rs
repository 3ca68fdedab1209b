//! Watched table identity and metadata.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Leases table column holding the last change version seen for a row.
pub const LEASES_CHANGE_VERSION_COLUMN: &str = "ChangeVersion";

/// Leases table column counting dispatch attempts for a row.
pub const LEASES_ATTEMPT_COUNT_COLUMN: &str = "AttemptCount";

/// Leases table column holding the lease expiry; null means unleased.
pub const LEASES_EXPIRATION_TIME_COLUMN: &str = "LeaseExpirationTime";

/// Column names the leases table reserves for its own bookkeeping.
pub const RESERVED_COLUMN_NAMES: [&str; 3] = [
    LEASES_CHANGE_VERSION_COLUMN,
    LEASES_ATTEMPT_COUNT_COLUMN,
    LEASES_EXPIRATION_TIME_COLUMN,
];

/// SQL types the trigger cannot read back or mirror into a leases table.
pub const UNSUPPORTED_COLUMN_TYPES: [&str; 8] = [
    "text",
    "ntext",
    "image",
    "xml",
    "sql_variant",
    "geography",
    "geometry",
    "hierarchyid",
];

const DEFAULT_SCHEMA: &str = "dbo";

/// Quote an identifier as `[name]`, doubling any closing bracket.
pub fn bracket_quote(identifier: &str) -> String {
    format!("[{}]", identifier.replace(']', "]]"))
}

/// Quote a value as a T-SQL string literal, doubling any single quote.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlObject {
    pub schema: String,
    pub name: String,
}

impl SqlObject {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `table`, `schema.table` or `[schema].[table]`.
    ///
    /// Bracketed parts may contain dots and escaped closing brackets (`]]`).
    /// An unqualified name lands in the `dbo` schema.
    pub fn parse(input: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidTableName {
            name: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("table name is empty"));
        }

        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = trimmed.chars().peekable();
        let mut in_brackets = false;
        let mut was_bracketed = false;

        while let Some(c) = chars.next() {
            match c {
                '[' if !in_brackets && current.is_empty() && !was_bracketed => {
                    in_brackets = true;
                    was_bracketed = true;
                }
                ']' if in_brackets => {
                    if chars.peek() == Some(&']') {
                        chars.next();
                        current.push(']');
                    } else {
                        in_brackets = false;
                    }
                }
                '.' if !in_brackets => {
                    parts.push(std::mem::take(&mut current));
                    was_bracketed = false;
                }
                _ if !in_brackets && was_bracketed => {
                    return Err(invalid("unexpected character after closing bracket"));
                }
                _ => current.push(c),
            }
        }
        if in_brackets {
            return Err(invalid("unterminated bracket"));
        }
        parts.push(current);

        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("name part is empty"));
        }

        match parts.len() {
            1 => Ok(Self::new(DEFAULT_SCHEMA, parts.remove(0))),
            2 => {
                let name = parts.remove(1);
                Ok(Self::new(parts.remove(0), name))
            }
            _ => Err(invalid("expected at most schema and table parts")),
        }
    }

    /// `[schema].[name]`, usable directly in T-SQL.
    pub fn bracketed(&self) -> String {
        format!("{}.{}", bracket_quote(&self.schema), bracket_quote(&self.name))
    }

    /// `N'[schema].[name]'`, for `OBJECT_ID` lookups.
    pub fn object_id_literal(&self) -> String {
        format!("N{}", quote_literal(&self.bracketed()))
    }

    /// Lower-cased `schema.name`, used as a cache key.
    pub fn normalized(&self) -> String {
        format!(
            "{}.{}",
            self.schema.to_lowercase(),
            self.name.to_lowercase()
        )
    }
}

impl fmt::Display for SqlObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A column name with its full SQL type text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Full type, e.g. `nvarchar(100)` or `decimal(18,2)`.
    pub sql_type: String,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }

    /// Build the full type text from `sys.columns` / `sys.types` fields.
    ///
    /// `max_length` is in bytes as reported by the catalog, so unicode
    /// character types are halved. `-1` renders as `(max)`.
    pub fn from_catalog(
        name: impl Into<String>,
        type_name: &str,
        max_length: i16,
        precision: u8,
        scale: u8,
    ) -> Self {
        let base = type_name.to_lowercase();
        let sql_type = match base.as_str() {
            "char" | "varchar" | "binary" | "varbinary" => {
                if max_length == -1 {
                    format!("{base}(max)")
                } else {
                    format!("{base}({max_length})")
                }
            }
            "nchar" | "nvarchar" => {
                if max_length == -1 {
                    format!("{base}(max)")
                } else {
                    format!("{base}({})", max_length / 2)
                }
            }
            "decimal" | "numeric" => format!("{base}({precision},{scale})"),
            "datetime2" | "time" | "datetimeoffset" => format!("{base}({scale})"),
            _ => base,
        };
        Self::new(name, sql_type)
    }

    /// Type name without any length or precision suffix.
    pub fn base_type(&self) -> &str {
        self.sql_type
            .split('(')
            .next()
            .unwrap_or(&self.sql_type)
            .trim()
    }

    pub fn is_unsupported(&self) -> bool {
        let base = self.base_type().to_lowercase();
        UNSUPPORTED_COLUMN_TYPES.contains(&base.as_str())
    }

    /// The reserved leases column this name collides with, if any.
    pub fn reserved_collision(&self) -> Option<&'static str> {
        RESERVED_COLUMN_NAMES
            .iter()
            .find(|reserved| reserved.eq_ignore_ascii_case(&self.name))
            .copied()
    }
}

/// A resolved, validated table being monitored for changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedTable {
    pub object: SqlObject,
    pub object_id: i32,
    /// Primary key columns in key ordinal order.
    pub primary_keys: Vec<ColumnDefinition>,
    pub columns: Vec<ColumnDefinition>,
}

impl WatchedTable {
    pub fn primary_key_names(&self) -> impl Iterator<Item = &str> {
        self.primary_keys.iter().map(|c| c.name.as_str())
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_keys
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unqualified_defaults_to_dbo() {
        let obj = SqlObject::parse("Products").unwrap();
        assert_eq!(obj, SqlObject::new("dbo", "Products"));
    }

    #[test]
    fn test_parse_qualified_and_bracketed() {
        assert_eq!(
            SqlObject::parse("sales.Orders").unwrap(),
            SqlObject::new("sales", "Orders")
        );
        assert_eq!(
            SqlObject::parse("[my.schema].[Odd]]Name]").unwrap(),
            SqlObject::new("my.schema", "Odd]Name")
        );
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for bad in ["", "  ", "a.b.c", "[dbo].[open", "dbo.", "[dbo]x.t"] {
            assert!(
                matches!(
                    SqlObject::parse(bad),
                    Err(ConfigurationError::InvalidTableName { .. })
                ),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_quoting_escapes() {
        let obj = SqlObject::new("dbo", "It's]here");
        assert_eq!(obj.bracketed(), "[dbo].[It's]]here]");
        assert_eq!(obj.object_id_literal(), "N'[dbo].[It''s]]here]'");
        assert_eq!(obj.normalized(), "dbo.it's]here");
    }

    #[test]
    fn test_column_type_from_catalog() {
        assert_eq!(
            ColumnDefinition::from_catalog("Name", "nvarchar", 200, 0, 0).sql_type,
            "nvarchar(100)"
        );
        assert_eq!(
            ColumnDefinition::from_catalog("Blob", "varbinary", -1, 0, 0).sql_type,
            "varbinary(max)"
        );
        assert_eq!(
            ColumnDefinition::from_catalog("Cost", "decimal", 9, 18, 2).sql_type,
            "decimal(18,2)"
        );
        assert_eq!(
            ColumnDefinition::from_catalog("At", "datetime2", 8, 27, 7).sql_type,
            "datetime2(7)"
        );
        assert_eq!(
            ColumnDefinition::from_catalog("Id", "int", 4, 10, 0).sql_type,
            "int"
        );
    }

    #[test]
    fn test_unsupported_and_reserved() {
        assert!(ColumnDefinition::new("Doc", "xml").is_unsupported());
        assert!(ColumnDefinition::new("Body", "NText").is_unsupported());
        assert!(!ColumnDefinition::new("Body", "nvarchar(max)").is_unsupported());

        assert_eq!(
            ColumnDefinition::new("changeversion", "int").reserved_collision(),
            Some(LEASES_CHANGE_VERSION_COLUMN)
        );
        assert_eq!(ColumnDefinition::new("Id", "int").reserved_collision(), None);
    }
}
