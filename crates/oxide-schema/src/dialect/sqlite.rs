//! SQLite dialect.
//!
//! SQLite cannot alter a column in place; the diff engine falls back to
//! drop-and-add or to a full table rebuild. Column types are compared by
//! affinity, which is all SQLite actually enforces.

use crate::error::{Result, SchemaError};
use crate::schema::{Column, ColumnType, DefaultValue};

use super::{enum_list, squash, ColumnChange, Dialect, Driver, NativeType};

/// SQLite dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Type affinity of a declared type, following SQLite's own rules.
    fn affinity(native: &str) -> &'static str {
        let upper = native.to_ascii_uppercase();
        if upper.contains("INT") {
            "INTEGER"
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            "TEXT"
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            "BLOB"
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            "REAL"
        } else {
            "NUMERIC"
        }
    }
}

impl Dialect for SqliteDialect {
    fn driver(&self) -> Driver {
        Driver::Sqlite
    }

    fn type_name(&self, column: &Column) -> Result<String> {
        let name = match column.isa {
            ColumnType::Int | ColumnType::BigInt | ColumnType::SmallInt | ColumnType::Bool => {
                "INTEGER"
            }
            ColumnType::Str
            | ColumnType::Text
            | ColumnType::Date
            | ColumnType::Time
            | ColumnType::DateTime
            | ColumnType::Json
            | ColumnType::Uuid
            | ColumnType::Enum => "TEXT",
            ColumnType::Float | ColumnType::Double => "REAL",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Binary => "BLOB",
        };
        Ok(name.to_string())
    }

    fn canonical_type(&self, native: &str) -> String {
        Self::affinity(native).to_string()
    }

    fn parse_native_type(&self, native: &str) -> NativeType {
        let upper = squash(native);
        let isa = match upper.as_str() {
            "BOOLEAN" | "BOOL" => ColumnType::Bool,
            "BIGINT" => ColumnType::BigInt,
            "SMALLINT" => ColumnType::SmallInt,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "DATETIME" | "TIMESTAMP" => ColumnType::DateTime,
            "DOUBLE" | "DOUBLE PRECISION" => ColumnType::Double,
            "JSON" => ColumnType::Json,
            _ => match Self::affinity(&upper) {
                "INTEGER" => ColumnType::Int,
                "TEXT" => ColumnType::Text,
                "BLOB" => ColumnType::Binary,
                "REAL" => ColumnType::Float,
                _ => ColumnType::Decimal,
            },
        };
        NativeType::of(isa)
    }

    fn supports_alter_column(&self) -> bool {
        false
    }

    fn supports_add_constraint(&self) -> bool {
        false
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn auto_increment_keyword(&self) -> &'static str {
        "AUTOINCREMENT"
    }

    fn column_suffix(&self, column: &Column) -> Option<String> {
        (column.isa == ColumnType::Enum && !column.enum_values.is_empty()).then(|| {
            format!(
                "CHECK ({} IN ({}))",
                self.quote_identifier(&column.name),
                enum_list(column)
            )
        })
    }

    fn render_default(&self, value: &DefaultValue) -> String {
        match value {
            DefaultValue::Expression(expr) if !expr.trim_start().starts_with('(') => {
                // Function calls must be parenthesized; bare keywords are fine either way.
                if expr.contains('(') {
                    format!("({expr})")
                } else {
                    expr.clone()
                }
            }
            other => other.to_sql(),
        }
    }

    fn modify_column(
        &self,
        table: &str,
        column: &Column,
        _change: ColumnChange,
    ) -> Result<Vec<String>> {
        Err(SchemaError::unsupported(
            self.name(),
            format!("altering column '{}.{}' in place", table, column.name),
        ))
    }

    fn lock_table(&self, table: &str) -> String {
        // A write inside the transaction escalates to SQLite's RESERVED lock.
        format!(
            "UPDATE {} SET {} = {} WHERE 1 = 0",
            self.quote_identifier(table),
            self.quote_identifier("name"),
            self.quote_identifier("name")
        )
    }
}
