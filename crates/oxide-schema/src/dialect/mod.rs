//! Database dialect implementations.
//!
//! Each dialect knows how to map semantic column types to native types, how
//! to quote identifiers and literals, and how to phrase the DDL the compiler
//! and the diff engine need.

mod mysql;
mod postgres;
mod sqlite;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::error::{Result, SchemaError};
use crate::schema::{quote_literal, Column, ColumnType, DefaultValue, IndexSchema, TableSchema};

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// SQLite 3.35+.
    Sqlite,
    /// PostgreSQL.
    #[serde(rename = "pgsql")]
    Postgres,
    /// MySQL / MariaDB.
    MySql,
}

static SQLITE: SqliteDialect = SqliteDialect;
static POSTGRES: PostgresDialect = PostgresDialect;
static MYSQL: MySqlDialect = MySqlDialect;

impl Driver {
    /// Canonical driver name, as written in DSN prefixes.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "pgsql",
            Self::MySql => "mysql",
        }
    }

    /// URL scheme understood by the connection layer.
    #[must_use]
    pub const fn url_scheme(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Returns the dialect for this driver.
    #[must_use]
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Self::Sqlite => &SQLITE,
            Self::Postgres => &POSTGRES,
            Self::MySql => &MYSQL,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Driver {
    type Err = SchemaError;

    /// Parses a driver name. Unknown names are rejected rather than guessed.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "pgsql" | "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(SchemaError::unsupported(other, "this driver")),
        }
    }
}

/// Which aspects of a column differ between two definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnChange {
    /// Native type differs.
    pub type_changed: bool,
    /// Effective nullability differs.
    pub nullable_changed: bool,
    /// Normalized default differs.
    pub default_changed: bool,
}

impl ColumnChange {
    /// Whether anything differs.
    #[must_use]
    pub const fn any(self) -> bool {
        self.type_changed || self.nullable_changed || self.default_changed
    }
}

/// Options controlling table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateOptions {
    /// Emit `IF NOT EXISTS`.
    pub if_not_exists: bool,
    /// Emit foreign key constraints for references.
    pub foreign_keys: bool,
}

/// Trait for database-specific SQL generation.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Returns the driver this dialect speaks for.
    fn driver(&self) -> Driver;

    /// Returns the dialect name.
    fn name(&self) -> &'static str {
        self.driver().name()
    }

    /// Maps a column to its native type, without key or nullability clauses.
    fn type_name(&self, column: &Column) -> Result<String>;

    /// Normalizes a native type string so equivalent spellings compare equal.
    fn canonical_type(&self, native: &str) -> String;

    /// Recovers a column type tag (and length/scale/unsigned) from a native
    /// type string reported by the catalog.
    fn parse_native_type(&self, native: &str) -> NativeType;

    /// Quote character for identifiers.
    fn quote_char(&self) -> char {
        '"'
    }

    /// Quotes an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        let q = self.quote_char();
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Bind placeholder for the `n`-th (1-based) parameter.
    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    /// Returns whether this dialect supports altering a column in place.
    fn supports_alter_column(&self) -> bool;

    /// Returns whether this dialect supports adding constraints after
    /// table creation.
    fn supports_add_constraint(&self) -> bool;

    /// Returns whether foreign key constraints are enforced.
    fn supports_foreign_keys(&self) -> bool {
        true
    }

    /// Returns whether DDL statements can be rolled back.
    fn supports_transactional_ddl(&self) -> bool;

    /// Returns whether `CREATE INDEX IF NOT EXISTS` is accepted.
    fn supports_index_if_not_exists(&self) -> bool {
        true
    }

    /// Returns the auto-increment keyword for this dialect.
    fn auto_increment_keyword(&self) -> &'static str;

    /// Native type used in a column definition. Dialects with serial types
    /// override this for auto-incremented keys.
    fn column_type(&self, column: &Column, _inline_pk: bool) -> Result<String> {
        self.type_name(column)
    }

    /// Extra clause appended to a column definition.
    fn column_suffix(&self, _column: &Column) -> Option<String> {
        None
    }

    /// Renders a default value as a SQL literal or expression.
    fn render_default(&self, value: &DefaultValue) -> String {
        value.to_sql()
    }

    /// Normalizes a default as stored in the catalog, or as rendered by
    /// [`Self::render_default`], so equal defaults compare equal.
    fn normalize_default(&self, raw: &str) -> Option<String> {
        let mut value = raw.trim();
        while value.len() >= 2 && value.starts_with('(') && value.ends_with(')') {
            value = value[1..value.len() - 1].trim();
        }
        if value.is_empty() || value.eq_ignore_ascii_case("NULL") {
            return None;
        }
        if value.starts_with('\'') {
            Some(value.to_string())
        } else {
            Some(value.to_ascii_uppercase())
        }
    }

    /// Generates column definition SQL.
    fn column_definition(&self, column: &Column, inline_pk: bool) -> Result<String> {
        let mut parts = vec![
            self.quote_identifier(&column.name),
            self.column_type(column, inline_pk)?,
        ];

        if inline_pk {
            parts.push("PRIMARY KEY".to_string());
            let keyword = self.auto_increment_keyword();
            if column.auto_increment && !keyword.is_empty() {
                parts.push(keyword.to_string());
            }
        } else if !column.effective_nullable() {
            parts.push("NOT NULL".to_string());
        }

        if column.unique && !column.primary_key {
            parts.push("UNIQUE".to_string());
        }

        if let Some(default) = &column.default {
            if !column.auto_increment {
                parts.push(format!("DEFAULT {}", self.render_default(default)));
            }
        }

        if let Some(suffix) = self.column_suffix(column) {
            parts.push(suffix);
        }

        Ok(parts.join(" "))
    }

    /// Suffix appended after the closing parenthesis of `CREATE TABLE`.
    fn table_options(&self, _table: &TableSchema) -> String {
        String::new()
    }

    /// Statements to run right after `CREATE TABLE` (comments and the like).
    fn post_create(&self, _table: &TableSchema) -> Vec<String> {
        Vec::new()
    }

    /// Generates SQL for creating a table from an expanded schema.
    fn create_table(&self, table: &TableSchema, options: CreateOptions) -> Result<String> {
        let inline_pk = if table.primary_key.len() == 1 {
            Some(table.primary_key[0].as_str())
        } else {
            None
        };

        let mut defs = Vec::new();
        for column in table.persisted_columns() {
            defs.push(self.column_definition(column, inline_pk == Some(column.name.as_str()))?);
        }

        if inline_pk.is_none() && !table.primary_key.is_empty() {
            let quoted: Vec<String> = table
                .primary_key
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect();
            defs.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }

        if options.foreign_keys && self.supports_foreign_keys() {
            for reference in &table.references {
                let mut fk = format!(
                    "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    self.quote_identifier(&reference.constraint_name(&table.name)),
                    self.quote_identifier(&reference.column),
                    self.quote_identifier(&reference.table),
                    self.quote_identifier(&reference.target_column),
                );
                if let Some(action) = reference.on_delete {
                    fk.push_str(" ON DELETE ");
                    fk.push_str(action.as_sql());
                }
                if let Some(action) = reference.on_update {
                    fk.push_str(" ON UPDATE ");
                    fk.push_str(action.as_sql());
                }
                defs.push(fk);
            }
        }

        let mut sql = String::from("CREATE TABLE ");
        if options.if_not_exists {
            sql.push_str("IF NOT EXISTS ");
        }
        sql.push_str(&self.quote_identifier(&table.name));
        sql.push_str(" (\n  ");
        sql.push_str(&defs.join(",\n  "));
        sql.push_str("\n)");
        sql.push_str(&self.table_options(table));
        Ok(sql)
    }

    /// Generates SQL for dropping a table.
    fn drop_table(&self, name: &str, if_exists: bool) -> String {
        let mut sql = String::from("DROP TABLE ");
        if if_exists {
            sql.push_str("IF EXISTS ");
        }
        sql.push_str(&self.quote_identifier(name));
        sql
    }

    /// Generates SQL for renaming a table.
    fn rename_table(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    /// Generates SQL for adding a column.
    fn add_column(&self, table: &str, column: &Column) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column, false)?
        ))
    }

    /// Generates SQL for dropping a column.
    fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_identifier(table),
            self.quote_identifier(column)
        )
    }

    /// Generates the statements altering `column` in place so it matches
    /// its new definition.
    fn modify_column(&self, table: &str, column: &Column, change: ColumnChange)
        -> Result<Vec<String>>;

    /// Generates SQL for creating an index.
    fn create_index(&self, table: &str, index: &IndexSchema, if_not_exists: bool) -> String {
        let mut sql = String::from("CREATE ");
        if index.unique {
            sql.push_str("UNIQUE ");
        }
        sql.push_str("INDEX ");
        if if_not_exists && self.supports_index_if_not_exists() {
            sql.push_str("IF NOT EXISTS ");
        }
        sql.push_str(&self.quote_identifier(&index.name));
        sql.push_str(" ON ");
        sql.push_str(&self.quote_identifier(table));
        let quoted: Vec<String> = index
            .columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect();
        sql.push_str(&format!(" ({})", quoted.join(", ")));
        sql
    }

    /// Generates SQL for dropping an index.
    fn drop_index(&self, _table: &str, name: &str) -> String {
        format!("DROP INDEX {}", self.quote_identifier(name))
    }

    /// Statement taking an exclusive lock on the metadata table inside a
    /// transaction, serializing concurrent migration runs.
    fn lock_table(&self, table: &str) -> String;
}

/// A native type decoded back into the schema vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeType {
    /// Closest semantic tag.
    pub isa: ColumnType,
    /// Length or precision.
    pub length: Option<u32>,
    /// Decimal scale.
    pub scale: Option<u32>,
    /// Unsigned integer.
    pub unsigned: bool,
}

impl NativeType {
    pub(crate) const fn of(isa: ColumnType) -> Self {
        Self {
            isa,
            length: None,
            scale: None,
            unsigned: false,
        }
    }
}

/// Splits `name(a, b) rest` into the uppercased base name, the numeric
/// arguments and the uppercased remainder.
pub(crate) fn split_native(native: &str) -> (String, Vec<u32>, String) {
    let native = native.trim();
    match (native.find('('), native.find(')')) {
        (Some(open), Some(close)) if close > open => {
            let base = native[..open].trim().to_ascii_uppercase();
            let args = native[open + 1..close]
                .split(',')
                .filter_map(|a| a.trim().parse().ok())
                .collect();
            let rest = native[close + 1..].trim().to_ascii_uppercase();
            (base, args, rest)
        }
        _ => (native.to_ascii_uppercase(), Vec::new(), String::new()),
    }
}

/// Collapses runs of whitespace and uppercases.
pub(crate) fn squash(native: &str) -> String {
    native
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Renders the `IN (...)` list of an enum column.
pub(crate) fn enum_list(column: &Column) -> String {
    column
        .enum_values
        .iter()
        .map(|v| quote_literal(v))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_from_str() {
        assert_eq!("sqlite".parse::<Driver>().unwrap(), Driver::Sqlite);
        assert_eq!("pgsql".parse::<Driver>().unwrap(), Driver::Postgres);
        assert_eq!("PostgreSQL".parse::<Driver>().unwrap(), Driver::Postgres);
        assert_eq!("mysql".parse::<Driver>().unwrap(), Driver::MySql);
    }

    #[test]
    fn test_unknown_driver_fails_closed() {
        let err = "oracle".parse::<Driver>().unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedDialect { .. }));
    }

    #[test]
    fn test_quote_identifier_escapes() {
        let sqlite = Driver::Sqlite.dialect();
        assert_eq!(sqlite.quote_identifier("a\"b"), "\"a\"\"b\"");
        let mysql = Driver::MySql.dialect();
        assert_eq!(mysql.quote_identifier("user"), "`user`");
    }

    #[test]
    fn test_split_native() {
        assert_eq!(
            split_native("numeric(10, 2)"),
            ("NUMERIC".to_string(), vec![10, 2], String::new())
        );
        assert_eq!(
            split_native("int(10) unsigned"),
            ("INT".to_string(), vec![10], "UNSIGNED".to_string())
        );
        assert_eq!(split_native("text"), ("TEXT".to_string(), vec![], String::new()));
    }

    #[test]
    fn test_normalize_default_strips_parentheses() {
        let sqlite = Driver::Sqlite.dialect();
        assert_eq!(
            sqlite.normalize_default("(current_timestamp)"),
            Some("CURRENT_TIMESTAMP".to_string())
        );
        assert_eq!(sqlite.normalize_default("'a'"), Some("'a'".to_string()));
        assert_eq!(sqlite.normalize_default("NULL"), None);
    }
}
