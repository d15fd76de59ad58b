//! PostgreSQL dialect.

use crate::error::{Result, SchemaError};
use crate::schema::{quote_literal, Column, ColumnType, DefaultValue, TableSchema};

use super::{split_native, squash, ColumnChange, Dialect, Driver, NativeType};

/// PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Creates a new PostgreSQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn driver(&self) -> Driver {
        Driver::Postgres
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn type_name(&self, column: &Column) -> Result<String> {
        if column.unsigned {
            return Err(SchemaError::unsupported(
                self.name(),
                format!("unsigned column '{}'", column.name),
            ));
        }
        let name = match column.isa {
            ColumnType::Int => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Str => match column.length {
                Some(len) => format!("VARCHAR({len})"),
                None => "TEXT".to_string(),
            },
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Float => "REAL".to_string(),
            ColumnType::Double => "DOUBLE PRECISION".to_string(),
            ColumnType::Decimal => match (column.length, column.scale) {
                (Some(p), Some(s)) => format!("NUMERIC({p}, {s})"),
                (Some(p), None) => format!("NUMERIC({p})"),
                _ => "NUMERIC".to_string(),
            },
            ColumnType::Bool => "BOOLEAN".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::DateTime => "TIMESTAMP".to_string(),
            ColumnType::Binary => "BYTEA".to_string(),
            ColumnType::Json => "JSONB".to_string(),
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Enum => {
                return Err(SchemaError::unsupported(
                    self.name(),
                    format!("enum column '{}'", column.name),
                ));
            }
        };
        Ok(name)
    }

    fn canonical_type(&self, native: &str) -> String {
        let (base, args, _) = split_native(native);
        let base = squash(&base);
        let base = match base.as_str() {
            "INT" | "INT4" | "INTEGER" | "SERIAL" | "SERIAL4" => "INTEGER",
            "INT8" | "BIGINT" | "BIGSERIAL" | "SERIAL8" => "BIGINT",
            "INT2" | "SMALLINT" | "SMALLSERIAL" => "SMALLINT",
            "CHARACTER VARYING" | "VARCHAR" => "VARCHAR",
            "CHARACTER" | "CHAR" | "BPCHAR" => "CHAR",
            "FLOAT4" | "REAL" => "REAL",
            "FLOAT8" | "DOUBLE PRECISION" | "FLOAT" => "DOUBLE PRECISION",
            "DECIMAL" | "NUMERIC" => "NUMERIC",
            "BOOL" | "BOOLEAN" => "BOOLEAN",
            "TIME WITHOUT TIME ZONE" | "TIME" => "TIME",
            "TIMESTAMP WITHOUT TIME ZONE" | "TIMESTAMP" => "TIMESTAMP",
            "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" => "TIMESTAMPTZ",
            other => return render_args(other, &args),
        };
        if base == "VARCHAR" && args.is_empty() {
            return "TEXT".to_string();
        }
        render_args(base, &args)
    }

    fn parse_native_type(&self, native: &str) -> NativeType {
        let canonical = self.canonical_type(native);
        let (base, args, _) = split_native(&canonical);
        let mut parsed = NativeType::of(match base.as_str() {
            "INTEGER" => ColumnType::Int,
            "BIGINT" => ColumnType::BigInt,
            "SMALLINT" => ColumnType::SmallInt,
            "VARCHAR" | "CHAR" => ColumnType::Str,
            "REAL" => ColumnType::Float,
            "DOUBLE PRECISION" => ColumnType::Double,
            "NUMERIC" => ColumnType::Decimal,
            "BOOLEAN" => ColumnType::Bool,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "TIMESTAMP" | "TIMESTAMPTZ" => ColumnType::DateTime,
            "BYTEA" => ColumnType::Binary,
            "JSON" | "JSONB" => ColumnType::Json,
            "UUID" => ColumnType::Uuid,
            _ => ColumnType::Text,
        });
        parsed.length = args.first().copied();
        parsed.scale = args.get(1).copied();
        parsed
    }

    fn supports_alter_column(&self) -> bool {
        true
    }

    fn supports_add_constraint(&self) -> bool {
        true
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn auto_increment_keyword(&self) -> &'static str {
        // Expressed through SERIAL types instead.
        ""
    }

    fn column_type(&self, column: &Column, inline_pk: bool) -> Result<String> {
        if inline_pk && column.auto_increment {
            return Ok(match column.isa {
                ColumnType::BigInt => "BIGSERIAL",
                ColumnType::SmallInt => "SMALLSERIAL",
                _ => "SERIAL",
            }
            .to_string());
        }
        self.type_name(column)
    }

    fn render_default(&self, value: &DefaultValue) -> String {
        match value {
            DefaultValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            other => other.to_sql(),
        }
    }

    fn normalize_default(&self, raw: &str) -> Option<String> {
        let mut value = raw.trim();
        if value.starts_with("nextval(") {
            return None;
        }
        // Strip trailing casts such as `'x'::character varying`.
        let mut numeric_cast = false;
        if let Some(pos) = value.rfind("::") {
            let after = &value[pos..];
            if !after.contains('\'') {
                numeric_cast = is_numeric_type(&after[2..]);
                value = value[..pos].trim();
            }
        }
        while value.len() >= 2 && value.starts_with('(') && value.ends_with(')') {
            value = value[1..value.len() - 1].trim();
        }
        // Negative numbers come back quoted: `'-1'::integer`.
        if numeric_cast && value.len() > 2 && value.starts_with('\'') && value.ends_with('\'') {
            let inner = &value[1..value.len() - 1];
            if is_numeric_literal(inner) {
                value = inner;
            }
        }
        match value.to_ascii_uppercase().as_str() {
            "" | "NULL" => None,
            "NOW()" => Some("CURRENT_TIMESTAMP".to_string()),
            upper if !value.starts_with('\'') => Some(upper.to_string()),
            _ => Some(value.to_string()),
        }
    }

    fn post_create(&self, table: &TableSchema) -> Vec<String> {
        let mut statements = Vec::new();
        if let Some(comment) = &table.comment {
            statements.push(format!(
                "COMMENT ON TABLE {} IS {}",
                self.quote_identifier(&table.name),
                quote_literal(comment)
            ));
        }
        for column in table.persisted_columns() {
            if let Some(comment) = &column.comment {
                statements.push(format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    self.quote_identifier(&table.name),
                    self.quote_identifier(&column.name),
                    quote_literal(comment)
                ));
            }
        }
        statements
    }

    fn drop_table(&self, name: &str, if_exists: bool) -> String {
        let mut sql = String::from("DROP TABLE ");
        if if_exists {
            sql.push_str("IF EXISTS ");
        }
        sql.push_str(&self.quote_identifier(name));
        sql.push_str(" CASCADE");
        sql
    }

    fn modify_column(
        &self,
        table: &str,
        column: &Column,
        change: ColumnChange,
    ) -> Result<Vec<String>> {
        let prefix = format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            self.quote_identifier(table),
            self.quote_identifier(&column.name)
        );
        let mut statements = Vec::new();

        if change.type_changed {
            let native = self.type_name(column)?;
            statements.push(format!(
                "{prefix} TYPE {native} USING {}::{native}",
                self.quote_identifier(&column.name)
            ));
        }
        if change.nullable_changed {
            if column.effective_nullable() {
                statements.push(format!("{prefix} DROP NOT NULL"));
            } else {
                statements.push(format!("{prefix} SET NOT NULL"));
            }
        }
        if change.default_changed {
            match &column.default {
                Some(default) => statements.push(format!(
                    "{prefix} SET DEFAULT {}",
                    self.render_default(default)
                )),
                None => statements.push(format!("{prefix} DROP DEFAULT")),
            }
        }
        Ok(statements)
    }

    fn lock_table(&self, table: &str) -> String {
        format!(
            "LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE",
            self.quote_identifier(table)
        )
    }
}

fn is_numeric_type(name: &str) -> bool {
    let name = name.trim().to_ascii_lowercase();
    let base = name.split('(').next().unwrap_or_default().trim();
    matches!(
        base,
        "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision"
    )
}

fn is_numeric_literal(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.matches('.').count() <= 1
}

fn render_args(base: &str, args: &[u32]) -> String {
    if args.is_empty() {
        base.to_string()
    } else {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        format!("{base}({})", args.join(", "))
    }
}
