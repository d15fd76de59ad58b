//! Live schema introspection.
//!
//! Reads table definitions back from the database catalog and rebuilds
//! them as flat [`TableSchema`]s, ready to be diffed against declarations.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use oxide_schema::dialect::{Dialect, Driver};
use oxide_schema::registry::METADATA_TABLE;
use oxide_schema::schema::{Column, ColumnType, DefaultValue, IndexSchema, TableSchema};
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::{debug, warn};

use crate::connection::{is_transient, Connection};
use crate::error::{MigrateError, Result};

const SQLITE_TABLES: &str = "SELECT name FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
const SQLITE_COLUMNS: &str = "SELECT name, type, CAST(\"notnull\" AS TEXT), dflt_value, \
     CAST(pk AS TEXT) FROM pragma_table_info(?) ORDER BY cid";
const SQLITE_CREATE_SQL: &str = "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?";
const SQLITE_INDEXES: &str =
    "SELECT name, CAST(\"unique\" AS TEXT), origin FROM pragma_index_list(?) ORDER BY name";
const SQLITE_INDEX_COLUMNS: &str = "SELECT name FROM pragma_index_info(?) ORDER BY seqno";

const POSTGRES_TABLES: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY table_name";
const POSTGRES_COLUMNS: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), \
     CASE WHEN a.attnotnull THEN '1' ELSE '0' END, pg_get_expr(d.adbin, d.adrelid), \
     a.attidentity::text, col_description(a.attrelid, a.attnum) \
     FROM pg_attribute a \
     LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
     WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";
const POSTGRES_PRIMARY_KEY: &str = "SELECT a.attname::text FROM pg_index i \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     WHERE i.indrelid = to_regclass($1) AND i.indisprimary \
     ORDER BY array_position(i.indkey::int2[], a.attnum)";
const POSTGRES_INDEXES: &str = "SELECT c.relname::text, a.attname::text, \
     CASE WHEN i.indisunique THEN '1' ELSE '0' END FROM pg_index i \
     JOIN pg_class c ON c.oid = i.indexrelid \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     WHERE i.indrelid = to_regclass($1) AND NOT i.indisprimary \
     AND NOT EXISTS (SELECT 1 FROM pg_constraint k WHERE k.conindid = i.indexrelid) \
     ORDER BY c.relname, array_position(i.indkey::int2[], a.attnum)";
const POSTGRES_UNIQUE_COLUMNS: &str = "SELECT a.attname::text FROM pg_constraint k \
     JOIN pg_attribute a ON a.attrelid = k.conrelid AND a.attnum = k.conkey[1] \
     WHERE k.conrelid = to_regclass($1) AND k.contype = 'u' AND array_length(k.conkey, 1) = 1";

const MYSQL_TABLES: &str = "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME";
const MYSQL_COLUMNS: &str = "SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR), \
     CAST(IS_NULLABLE AS CHAR), CAST(COLUMN_DEFAULT AS CHAR), CAST(EXTRA AS CHAR), \
     CAST(COLUMN_COMMENT AS CHAR) FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION";
const MYSQL_INDEXES: &str = "SELECT CAST(INDEX_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR), \
     CAST(1 - NON_UNIQUE AS CHAR) FROM information_schema.STATISTICS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY INDEX_NAME, SEQ_IN_INDEX";

/// A column as reported by the catalog.
#[derive(Debug, Clone, Default)]
struct RawColumn {
    name: String,
    native: String,
    nullable: bool,
    default: Option<String>,
    auto_increment: bool,
    comment: Option<String>,
}

/// A table as reported by the catalog.
#[derive(Debug, Clone, Default)]
struct RawTable {
    name: String,
    columns: Vec<RawColumn>,
    primary_key: Vec<String>,
    indexes: Vec<IndexSchema>,
    unique_columns: BTreeSet<String>,
}

/// Reads table definitions from a live database.
#[derive(Debug, Clone)]
pub struct TableIntrospector {
    connection: Connection,
    attempts: u32,
}

impl TableIntrospector {
    /// Creates an introspector that tries each catalog query up to three
    /// times on transient errors.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            attempts: 3,
        }
    }

    /// Sets how many times a catalog query is tried. At least once.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn dialect(&self) -> &'static dyn Dialect {
        self.connection.dialect()
    }

    /// Names of the user tables, sorted. The metadata table is left out.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let sql = match self.connection.driver() {
            Driver::Sqlite => SQLITE_TABLES,
            Driver::Postgres => POSTGRES_TABLES,
            Driver::MySql => MYSQL_TABLES,
        };
        let rows = self.fetch("tables", sql, &[]).await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(name) = text(row, 0, "tables")? {
                if name != METADATA_TABLE {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Reads one table. Returns `None` if it does not exist.
    ///
    /// A table that exists but reports no columns is an error, never an
    /// empty schema.
    pub async fn introspect_table(&self, name: &str) -> Result<Option<TableSchema>> {
        if !self.table_names().await?.iter().any(|t| t == name) {
            return Ok(None);
        }
        self.read_table(name).await.map(Some)
    }

    /// Reads every user table, keyed by name.
    pub async fn introspect_all(&self) -> Result<BTreeMap<String, TableSchema>> {
        let mut tables = BTreeMap::new();
        for name in self.table_names().await? {
            let table = self.read_table(&name).await?;
            tables.insert(name, table);
        }
        debug!(id = %self.connection.id(), tables = tables.len(), "Introspected database");
        Ok(tables)
    }

    async fn read_table(&self, name: &str) -> Result<TableSchema> {
        let raw = match self.connection.driver() {
            Driver::Sqlite => self.read_sqlite(name).await?,
            Driver::Postgres => self.read_postgres(name).await?,
            Driver::MySql => self.read_mysql(name).await?,
        };
        let table = build_table(self.dialect(), raw)?;
        debug!(table = %name, columns = table.columns.len(), indexes = table.indexes.len(), "Introspected table");
        Ok(table)
    }

    async fn read_sqlite(&self, name: &str) -> Result<RawTable> {
        let mut raw = RawTable {
            name: name.to_string(),
            ..RawTable::default()
        };

        let mut keyed = Vec::new();
        for row in &self.fetch(name, SQLITE_COLUMNS, &[name]).await? {
            let column = RawColumn {
                name: required(row, 0, name)?,
                native: text(row, 1, name)?.unwrap_or_default(),
                nullable: !flag(text(row, 2, name)?.as_deref()),
                default: text(row, 3, name)?,
                ..RawColumn::default()
            };
            let position: usize = text(row, 4, name)?
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            if position > 0 {
                keyed.push((position, column.name.clone()));
            }
            raw.columns.push(column);
        }
        keyed.sort();
        raw.primary_key = keyed.into_iter().map(|(_, column)| column).collect();

        let create_sql = self
            .fetch(name, SQLITE_CREATE_SQL, &[name])
            .await?
            .first()
            .map(|row| text(row, 0, name))
            .transpose()?
            .flatten()
            .unwrap_or_default();
        if create_sql.to_ascii_uppercase().contains("AUTOINCREMENT") && raw.primary_key.len() == 1 {
            let key = &raw.primary_key[0];
            if let Some(column) = raw.columns.iter_mut().find(|c| &c.name == key) {
                column.auto_increment = true;
            }
        }

        for row in &self.fetch(name, SQLITE_INDEXES, &[name]).await? {
            let index_name = required(row, 0, name)?;
            let unique = flag(text(row, 1, name)?.as_deref());
            let origin = text(row, 2, name)?.unwrap_or_default();
            if origin == "pk" {
                continue;
            }
            let mut columns = Vec::new();
            for column in &self.fetch(name, SQLITE_INDEX_COLUMNS, &[index_name.as_str()]).await? {
                columns.push(required(column, 0, name)?);
            }
            if origin == "u" {
                if let [column] = columns.as_slice() {
                    raw.unique_columns.insert(column.clone());
                }
                continue;
            }
            let mut index = IndexSchema::new(index_name, columns);
            index.unique = unique;
            raw.indexes.push(index);
        }
        Ok(raw)
    }

    async fn read_postgres(&self, name: &str) -> Result<RawTable> {
        let relation = self.dialect().quote_identifier(name);
        let relation = relation.as_str();
        let mut raw = RawTable {
            name: name.to_string(),
            ..RawTable::default()
        };

        for row in &self.fetch(name, POSTGRES_COLUMNS, &[relation]).await? {
            let default = text(row, 3, name)?;
            let identity = text(row, 4, name)?.unwrap_or_default();
            let auto_increment = !identity.is_empty()
                || default.as_deref().is_some_and(|d| d.starts_with("nextval("));
            raw.columns.push(RawColumn {
                name: required(row, 0, name)?,
                native: required(row, 1, name)?,
                nullable: !flag(text(row, 2, name)?.as_deref()),
                default,
                auto_increment,
                comment: text(row, 5, name)?,
            });
        }

        for row in &self.fetch(name, POSTGRES_PRIMARY_KEY, &[relation]).await? {
            raw.primary_key.push(required(row, 0, name)?);
        }
        for row in &self.fetch(name, POSTGRES_UNIQUE_COLUMNS, &[relation]).await? {
            raw.unique_columns.insert(required(row, 0, name)?);
        }

        let rows = self.fetch(name, POSTGRES_INDEXES, &[relation]).await?;
        raw.indexes = group_indexes(&rows, name, |_| false)?;
        Ok(raw)
    }

    async fn read_mysql(&self, name: &str) -> Result<RawTable> {
        let mut raw = RawTable {
            name: name.to_string(),
            ..RawTable::default()
        };

        for row in &self.fetch(name, MYSQL_COLUMNS, &[name]).await? {
            let extra = text(row, 4, name)?.unwrap_or_default();
            raw.columns.push(RawColumn {
                name: required(row, 0, name)?,
                native: required(row, 1, name)?,
                nullable: text(row, 2, name)?.as_deref() == Some("YES"),
                default: text(row, 3, name)?,
                auto_increment: extra.to_ascii_lowercase().contains("auto_increment"),
                comment: text(row, 5, name)?,
            });
        }

        let rows = self.fetch(name, MYSQL_INDEXES, &[name]).await?;
        // InnoDB backs every foreign key with an index named after it.
        let foreign_key_prefix = format!("fk_{name}_");
        for index in group_indexes(&rows, name, |index| index.starts_with(&foreign_key_prefix))? {
            if index.name == "PRIMARY" {
                raw.primary_key = index.columns;
            } else if index.unique && index.columns.len() == 1 && index.columns[0] == index.name {
                raw.unique_columns.insert(index.name);
            } else {
                raw.indexes.push(index);
            }
        }
        Ok(raw)
    }

    async fn fetch(&self, object: &str, sql: &str, binds: &[&str]) -> Result<Vec<AnyRow>> {
        let mut attempt = 1;
        loop {
            let mut query = sqlx::query(sql);
            for value in binds {
                query = query.bind((*value).to_string());
            }
            match query.fetch_all(self.connection.pool()).await {
                Ok(rows) => return Ok(rows),
                Err(err) if is_transient(&err) && attempt < self.attempts => {
                    warn!(object = %object, attempt, error = %err, "Retrying catalog query");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(MigrateError::Introspection {
                        target: object.to_string(),
                        source,
                    })
                }
            }
        }
    }
}

fn text(row: &AnyRow, index: usize, object: &str) -> Result<Option<String>> {
    row.try_get::<Option<String>, _>(index)
        .map_err(|source| MigrateError::Introspection {
            target: object.to_string(),
            source,
        })
}

fn required(row: &AnyRow, index: usize, object: &str) -> Result<String> {
    text(row, index, object)?.ok_or_else(|| MigrateError::Introspection {
        target: object.to_string(),
        source: sqlx::Error::ColumnDecode {
            index: index.to_string(),
            source: "unexpected NULL in catalog".into(),
        },
    })
}

fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "t" | "true" | "YES"))
}

/// Folds `(index, column, unique)` rows into indexes.
fn group_indexes(
    rows: &[AnyRow],
    object: &str,
    skip: impl Fn(&str) -> bool,
) -> Result<Vec<IndexSchema>> {
    let mut indexes: Vec<IndexSchema> = Vec::new();
    for row in rows {
        let name = required(row, 0, object)?;
        let column = required(row, 1, object)?;
        if skip(&name) {
            continue;
        }
        match indexes.last_mut() {
            Some(index) if index.name == name => index.columns.push(column),
            _ => {
                let mut index = IndexSchema::new(name, [column]);
                index.unique = flag(text(row, 2, object)?.as_deref());
                indexes.push(index);
            }
        }
    }
    Ok(indexes)
}

fn enum_values(native: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (native.find('('), native.rfind(')')) else {
        return Vec::new();
    };
    native[open + 1..close]
        .split(',')
        .map(|value| {
            value
                .trim()
                .trim_matches('\'')
                .replace("''", "'")
        })
        .collect()
}

fn build_table(dialect: &dyn Dialect, raw: RawTable) -> Result<TableSchema> {
    if raw.columns.is_empty() {
        return Err(MigrateError::IncompleteIntrospection(raw.name));
    }

    let mut table = TableSchema::new(&raw.name).without_auto_id();
    for reported in raw.columns {
        let native = dialect.parse_native_type(&reported.native);
        let mut column = Column::new(reported.name, native.isa);
        column.length = native.length;
        column.scale = native.scale;
        column.unsigned = native.unsigned;
        column.nullable = reported.nullable;
        column.primary_key = raw.primary_key.contains(&column.name);
        column.auto_increment = reported.auto_increment;
        column.unique = raw.unique_columns.contains(&column.name);
        if !column.auto_increment {
            column.default = reported
                .default
                .as_deref()
                .and_then(|value| dialect.normalize_default(value))
                .map(DefaultValue::Expression);
        }
        if native.isa == ColumnType::Enum {
            column.enum_values = enum_values(&reported.native);
        }
        column.comment = reported.comment.filter(|c| !c.is_empty());
        column.native_type = Some(reported.native);
        table = table.column(column);
    }

    Ok(raw
        .indexes
        .into_iter()
        .fold(table.primary_key(raw.primary_key), TableSchema::index)
        .flattened())
}

#[cfg(test)]
mod tests {
    use oxide_schema::compiler::SchemaCompiler;
    use oxide_schema::datasource::DataSourceConfig;
    use oxide_schema::diff::SchemaDiffEngine;

    use super::*;

    async fn memory() -> Connection {
        let source = DataSourceConfig::from_dsn("sqlite::memory:")
            .normalize("default")
            .unwrap();
        Connection::open(&source).await.unwrap()
    }

    fn users() -> TableSchema {
        TableSchema::new("users")
            .column(Column::new("email", ColumnType::Str).length(255).not_null().unique())
            .column(Column::new("age", ColumnType::Int).default(DefaultValue::Integer(18)).indexed())
            .column(Column::new("bio", ColumnType::Text))
            .column(Column::new("label", ColumnType::Str).as_virtual())
    }

    #[test]
    fn test_table_without_columns_is_an_error() {
        let raw = RawTable {
            name: "ghost".into(),
            ..RawTable::default()
        };
        let err = build_table(Driver::Sqlite.dialect(), raw).unwrap_err();
        assert!(matches!(err, MigrateError::IncompleteIntrospection(ref t) if t == "ghost"));
    }

    #[test]
    fn test_enum_values() {
        assert_eq!(enum_values("enum('a','b c','it''s')"), vec!["a", "b c", "it's"]);
        assert!(enum_values("int").is_empty());
    }

    #[test]
    fn test_build_table_normalizes_catalog_rows() {
        let raw = RawTable {
            name: "t".into(),
            columns: vec![
                RawColumn {
                    name: "id".into(),
                    native: "int unsigned".into(),
                    auto_increment: true,
                    default: Some("0".into()),
                    ..RawColumn::default()
                },
                RawColumn {
                    name: "state".into(),
                    native: "enum('on','off')".into(),
                    nullable: true,
                    default: Some("on".into()),
                    comment: Some(String::new()),
                    ..RawColumn::default()
                },
            ],
            primary_key: vec!["id".into()],
            ..RawTable::default()
        };
        let table = build_table(Driver::MySql.dialect(), raw).unwrap();

        let id = table.get_column("id").unwrap();
        assert!(id.primary_key && id.auto_increment && id.unsigned);
        assert_eq!(id.default, None);

        let state = table.get_column("state").unwrap();
        assert_eq!(state.isa, ColumnType::Enum);
        assert_eq!(state.enum_values, vec!["on", "off"]);
        assert_eq!(state.default, Some(DefaultValue::Expression("'on'".into())));
        assert_eq!(state.comment, None);
        assert!(table.is_expanded());
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let connection = memory().await;
        let dialect = connection.dialect();
        let declared = {
            let mut table = users();
            table.expand_with(|_| None).unwrap();
            table
        };
        let statements = SchemaCompiler::new(dialect).compile(&declared).unwrap();
        connection.execute_all(&statements).await.unwrap();

        let introspector = TableIntrospector::new(connection);
        let actual = introspector.introspect_table("users").await.unwrap().unwrap();

        assert_eq!(actual.primary_key, vec!["id"]);
        assert!(actual.get_column("id").unwrap().auto_increment);
        assert!(actual.get_column("email").unwrap().unique);
        assert!(!actual.get_column("email").unwrap().nullable);
        assert!(actual.get_column("label").is_none());
        assert_eq!(actual.indexes.len(), 1);
        assert_eq!(actual.indexes[0].name, "idx_users_age");

        let report = SchemaDiffEngine::new(dialect)
            .diff_table(&declared, &actual)
            .unwrap();
        assert!(report.is_empty(), "unexpected changes: {report:?}");
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_and_metadata_are_skipped() {
        let connection = memory().await;
        connection
            .execute_all(&[
                format!("CREATE TABLE \"{METADATA_TABLE}\" (id INTEGER PRIMARY KEY)"),
                "CREATE TABLE notes (body TEXT)".to_string(),
            ])
            .await
            .unwrap();

        let introspector = TableIntrospector::new(connection);
        assert_eq!(introspector.table_names().await.unwrap(), vec!["notes"]);
        assert!(introspector.introspect_table("absent").await.unwrap().is_none());

        let all = introspector.introspect_all().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["notes"]);
        // No primary key at all: nothing is synthesized for a live table.
        assert!(all["notes"].primary_key.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_catalog_query_is_reported() {
        let connection = memory().await;
        connection.close().await;

        let err = TableIntrospector::new(connection)
            .with_attempts(1)
            .table_names()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Introspection { ref target, .. } if target == "tables"));
    }
}
