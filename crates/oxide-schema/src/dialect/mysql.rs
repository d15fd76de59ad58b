//! MySQL dialect.
//!
//! DDL is not transactional on MySQL: every statement commits implicitly.

use crate::error::Result;
use crate::schema::{quote_literal, Column, ColumnType, DefaultValue, TableSchema};

use super::{enum_list, split_native, ColumnChange, Dialect, Driver, NativeType};

const TABLE_OPTIONS: &str = " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci";

/// MySQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    /// Creates a new MySQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Dialect for MySqlDialect {
    fn driver(&self) -> Driver {
        Driver::MySql
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn type_name(&self, column: &Column) -> Result<String> {
        let mut name = match column.isa {
            ColumnType::Int => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Str => format!("VARCHAR({})", column.length.unwrap_or(255)),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Float => "FLOAT".to_string(),
            ColumnType::Double => "DOUBLE".to_string(),
            ColumnType::Decimal => format!(
                "DECIMAL({}, {})",
                column.length.unwrap_or(10),
                column.scale.unwrap_or(0)
            ),
            ColumnType::Bool => "TINYINT(1)".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::DateTime => "DATETIME".to_string(),
            ColumnType::Binary => match column.length {
                Some(len) => format!("VARBINARY({len})"),
                None => "BLOB".to_string(),
            },
            ColumnType::Json => "JSON".to_string(),
            ColumnType::Uuid => "BINARY(16)".to_string(),
            ColumnType::Enum => format!("ENUM({})", enum_list(column)),
        };
        if column.unsigned && column.isa.is_integer() {
            name.push_str(" UNSIGNED");
        }
        Ok(name)
    }

    fn canonical_type(&self, native: &str) -> String {
        let trimmed = native.trim();
        if trimmed.to_ascii_uppercase().starts_with("ENUM(") {
            // Keep the value list verbatim; only the keyword is case-folded.
            let compact: String = trimmed[4..]
                .split(',')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(", ");
            return format!("ENUM{compact}");
        }
        let (stripped, unsigned) = strip_modifiers(trimmed);
        let (base, args, _) = split_native(&stripped);
        let base = match base.as_str() {
            "INTEGER" => "INT",
            "BOOL" | "BOOLEAN" => return "TINYINT(1)".to_string(),
            "NUMERIC" => "DECIMAL",
            "DOUBLE PRECISION" | "REAL" => "DOUBLE",
            other => other,
        };
        // Integer display widths carry no meaning, except TINYINT(1).
        let keep_args = !matches!(base, "INT" | "BIGINT" | "SMALLINT" | "MEDIUMINT")
            && !(base == "TINYINT" && args != [1]);
        let mut canonical = if keep_args && !args.is_empty() {
            let args: Vec<String> = args.iter().map(ToString::to_string).collect();
            format!("{base}({})", args.join(", "))
        } else {
            base.to_string()
        };
        if unsigned {
            canonical.push_str(" UNSIGNED");
        }
        canonical
    }

    fn parse_native_type(&self, native: &str) -> NativeType {
        let (stripped, unsigned) = strip_modifiers(&self.canonical_type(native));
        let (base, args, _) = split_native(&stripped);
        let isa = match base.as_str() {
            "INT" | "MEDIUMINT" => ColumnType::Int,
            "BIGINT" => ColumnType::BigInt,
            "SMALLINT" => ColumnType::SmallInt,
            "TINYINT" if args == [1] => ColumnType::Bool,
            "TINYINT" => ColumnType::SmallInt,
            "VARCHAR" | "CHAR" => ColumnType::Str,
            "FLOAT" => ColumnType::Float,
            "DOUBLE" => ColumnType::Double,
            "DECIMAL" => ColumnType::Decimal,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "DATETIME" | "TIMESTAMP" => ColumnType::DateTime,
            "BINARY" if args == [16] => ColumnType::Uuid,
            "BINARY" | "VARBINARY" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => ColumnType::Binary,
            "JSON" => ColumnType::Json,
            "ENUM" => ColumnType::Enum,
            _ => ColumnType::Text,
        };
        let mut parsed = NativeType::of(isa);
        if matches!(isa, ColumnType::Str | ColumnType::Decimal | ColumnType::Binary) {
            parsed.length = args.first().copied();
            parsed.scale = args.get(1).copied();
        }
        parsed.unsigned = unsigned;
        parsed
    }

    fn supports_alter_column(&self) -> bool {
        true
    }

    fn supports_add_constraint(&self) -> bool {
        true
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn supports_index_if_not_exists(&self) -> bool {
        false
    }

    fn auto_increment_keyword(&self) -> &'static str {
        "AUTO_INCREMENT"
    }

    fn column_suffix(&self, column: &Column) -> Option<String> {
        column
            .comment
            .as_ref()
            .map(|comment| format!("COMMENT {}", quote_literal(comment)))
    }

    fn render_default(&self, value: &DefaultValue) -> String {
        value.to_sql()
    }

    fn normalize_default(&self, raw: &str) -> Option<String> {
        let value = raw.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("NULL") {
            return None;
        }
        let upper = value.to_ascii_uppercase();
        if value.starts_with('\'') {
            return Some(value.to_string());
        }
        let keyword = upper.starts_with("CURRENT_")
            || upper.ends_with(')')
            || upper == "TRUE"
            || upper == "FALSE";
        if keyword || value.parse::<f64>().is_ok() {
            Some(upper)
        } else {
            // information_schema reports string defaults unquoted.
            Some(quote_literal(value))
        }
    }

    fn table_options(&self, table: &TableSchema) -> String {
        match &table.comment {
            Some(comment) => format!("{TABLE_OPTIONS} COMMENT={}", quote_literal(comment)),
            None => TABLE_OPTIONS.to_string(),
        }
    }

    fn drop_index(&self, table: &str, name: &str) -> String {
        format!(
            "DROP INDEX {} ON {}",
            self.quote_identifier(name),
            self.quote_identifier(table)
        )
    }

    fn modify_column(
        &self,
        table: &str,
        column: &Column,
        _change: ColumnChange,
    ) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column, false)?
        )])
    }

    fn lock_table(&self, table: &str) -> String {
        format!(
            "SELECT {} FROM {} FOR UPDATE",
            self.quote_identifier("id"),
            self.quote_identifier(table)
        )
    }
}

/// Removes `UNSIGNED` and `ZEROFILL`, reporting whether the type was unsigned.
fn strip_modifiers(native: &str) -> (String, bool) {
    let upper = native.to_ascii_uppercase();
    let unsigned = upper.contains("UNSIGNED");
    let stripped = upper
        .replace("UNSIGNED", "")
        .replace("ZEROFILL", "")
        .trim()
        .to_string();
    (stripped, unsigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::CreateOptions;

    #[test]
    fn test_create_table_with_options() {
        let d = MySqlDialect::new();
        let table = TableSchema::new("users")
            .column(
                Column::new("id", ColumnType::Int)
                    .unsigned()
                    .primary_key()
                    .auto_increment(),
            )
            .column(Column::new("token", ColumnType::Uuid).not_null())
            .column(Column::new("role", ColumnType::Enum).values(["admin", "user"]))
            .comment("Accounts")
            .flattened();

        let sql = d.create_table(&table, CreateOptions::default()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE `users` (\n  \
             `id` INT UNSIGNED PRIMARY KEY AUTO_INCREMENT,\n  \
             `token` BINARY(16) NOT NULL,\n  \
             `role` ENUM('admin', 'user')\n\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci COMMENT='Accounts'"
        );
    }

    #[test]
    fn test_canonical_type() {
        let d = MySqlDialect::new();
        assert_eq!(d.canonical_type("int(11)"), "INT");
        assert_eq!(d.canonical_type("int(10) unsigned"), "INT UNSIGNED");
        assert_eq!(d.canonical_type("tinyint(1)"), "TINYINT(1)");
        assert_eq!(d.canonical_type("BOOLEAN"), "TINYINT(1)");
        assert_eq!(d.canonical_type("decimal(10,2)"), "DECIMAL(10, 2)");
        assert_eq!(d.canonical_type("enum('a','b')"), "ENUM('a', 'b')");
    }

    #[test]
    fn test_parse_native_type() {
        let d = MySqlDialect::new();
        assert_eq!(d.parse_native_type("binary(16)").isa, ColumnType::Uuid);
        assert_eq!(d.parse_native_type("tinyint(1)").isa, ColumnType::Bool);
        let varchar = d.parse_native_type("varchar(64)");
        assert_eq!(varchar.isa, ColumnType::Str);
        assert_eq!(varchar.length, Some(64));
        assert!(d.parse_native_type("bigint unsigned").unsigned);
    }

    #[test]
    fn test_normalize_default() {
        let d = MySqlDialect::new();
        assert_eq!(d.normalize_default("abc"), Some("'abc'".to_string()));
        assert_eq!(d.normalize_default("'abc'"), Some("'abc'".to_string()));
        assert_eq!(d.normalize_default("0"), Some("0".to_string()));
        assert_eq!(
            d.normalize_default("current_timestamp()"),
            Some("CURRENT_TIMESTAMP()".to_string())
        );
    }

    #[test]
    fn test_index_statements() {
        let d = MySqlDialect::new();
        let index = crate::schema::IndexSchema::new("idx_users_email", ["email"]);
        assert_eq!(
            d.create_index("users", &index, true),
            "CREATE INDEX `idx_users_email` ON `users` (`email`)"
        );
        assert_eq!(
            d.drop_index("users", "idx_users_email"),
            "DROP INDEX `idx_users_email` ON `users`"
        );
    }

    #[test]
    fn test_modify_column() {
        let d = MySqlDialect::new();
        let column = Column::new("name", ColumnType::Str).length(100).not_null();
        assert_eq!(
            d.modify_column("users", &column, ColumnChange::default()).unwrap(),
            vec!["ALTER TABLE `users` MODIFY COLUMN `name` VARCHAR(100) NOT NULL"]
        );
    }
}
