//! Bookkeeping in the `__meta__` table.
//!
//! The table is a plain `(id, name, value)` log. Singleton keys such as
//! `schema_built_at` are updated in place; migration records, failure
//! markers and resolutions are appended and read back in insertion order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use oxide_schema::compiler::{CompileOptions, SchemaCompiler};
use oxide_schema::dialect::Dialect;
use oxide_schema::registry::METADATA_TABLE;
use oxide_schema::schema::{Column, ColumnType, TableSchema};
use serde::{Deserialize, Serialize};
use sqlx::{Any, Executor};
use tracing::debug;

use crate::connection::Connection;
use crate::error::Result;

/// Key of applied-migration records.
pub const MIGRATION_KEY: &str = "migration";
/// Key of failure markers.
pub const FAILURE_KEY: &str = "migration_failure";
/// Key of failure resolutions.
pub const RESOLVED_KEY: &str = "migration_resolved";
/// Key of the last full schema build timestamp.
pub const BUILT_AT_KEY: &str = "schema_built_at";

/// A migration script that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Script id.
    pub id: String,
    /// Script label.
    pub label: String,
    /// When the script was committed.
    pub applied_at: DateTime<Utc>,
}

/// What went wrong with a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureState {
    /// A DDL statement failed.
    Failed,
    /// The DDL ran but recording it failed.
    Unrecorded,
}

/// A failure that needs reconciliation before upgrading again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Script id.
    pub id: String,
    /// Kind of failure.
    pub state: FailureState,
    /// Statement that failed, if a statement did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Driver error message.
    pub error: String,
    /// When the failure happened.
    pub at: DateTime<Utc>,
}

/// Declaration of the metadata table.
#[must_use]
pub fn metadata_table() -> TableSchema {
    TableSchema::new(METADATA_TABLE)
        .column(Column::new("name", ColumnType::Str).length(128).not_null())
        .column(Column::new("value", ColumnType::Text))
}

fn select_sql(dialect: &dyn Dialect) -> String {
    format!(
        "SELECT {value} FROM {table} WHERE {name} = {p1} ORDER BY {id}",
        value = dialect.quote_identifier("value"),
        table = dialect.quote_identifier(METADATA_TABLE),
        name = dialect.quote_identifier("name"),
        id = dialect.quote_identifier("id"),
        p1 = dialect.placeholder(1),
    )
}

fn insert_sql(dialect: &dyn Dialect) -> String {
    format!(
        "INSERT INTO {table} ({name}, {value}) VALUES ({p1}, {p2})",
        table = dialect.quote_identifier(METADATA_TABLE),
        name = dialect.quote_identifier("name"),
        value = dialect.quote_identifier("value"),
        p1 = dialect.placeholder(1),
        p2 = dialect.placeholder(2),
    )
}

fn update_sql(dialect: &dyn Dialect) -> String {
    format!(
        "UPDATE {table} SET {value} = {p1} WHERE {name} = {p2}",
        table = dialect.quote_identifier(METADATA_TABLE),
        value = dialect.quote_identifier("value"),
        name = dialect.quote_identifier("name"),
        p1 = dialect.placeholder(1),
        p2 = dialect.placeholder(2),
    )
}

/// Values stored under `name`, oldest first, through any executor.
pub(crate) async fn values_with<'e, E>(
    executor: E,
    dialect: &dyn Dialect,
    name: &str,
) -> sqlx::Result<Vec<String>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = select_sql(dialect);
    let values: Vec<Option<String>> = sqlx::query_scalar(&sql)
        .bind(name.to_string())
        .fetch_all(executor)
        .await?;
    Ok(values.into_iter().flatten().collect())
}

/// Appends a row through any executor.
pub(crate) async fn insert_with<'e, E>(
    executor: E,
    dialect: &dyn Dialect,
    name: &str,
    value: &str,
) -> sqlx::Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = insert_sql(dialect);
    sqlx::query(&sql)
        .bind(name.to_string())
        .bind(value.to_string())
        .execute(executor)
        .await?;
    Ok(())
}

/// Highest applied script id among serialized migration records.
pub(crate) fn last_applied_of(records: &[String]) -> Result<Option<String>> {
    let mut last: Option<String> = None;
    for raw in records {
        let record: MigrationRecord = serde_json::from_str(raw)?;
        if last.as_deref().map_or(true, |l| record.id.as_str() > l) {
            last = Some(record.id);
        }
    }
    Ok(last)
}

/// Reads and writes the metadata table of one connection.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    connection: Connection,
}

impl MetadataStore {
    /// Creates a store over `connection`.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The connection the store writes to.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn dialect(&self) -> &'static dyn Dialect {
        self.connection.dialect()
    }

    /// Creates the metadata table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let options = CompileOptions::default()
            .if_not_exists(true)
            .foreign_keys(false);
        let statements = SchemaCompiler::new(self.dialect())
            .with_options(options)
            .compile(&metadata_table())?;
        self.connection.execute_all(&statements).await
    }

    /// Latest value stored under `name`.
    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values(name).await?.pop())
    }

    /// Every value stored under `name`, oldest first.
    pub async fn values(&self, name: &str) -> Result<Vec<String>> {
        Ok(values_with(self.connection.pool(), self.dialect(), name).await?)
    }

    /// Stores `value` under `name`, replacing what was there.
    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        let sql = update_sql(self.dialect());
        let updated = sqlx::query(&sql)
            .bind(value.to_string())
            .bind(name.to_string())
            .execute(self.connection.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            self.append(name, value).await?;
        }
        debug!(name = %name, "Stored metadata");
        Ok(())
    }

    /// Appends a value under `name`, keeping earlier ones.
    pub async fn append(&self, name: &str, value: &str) -> Result<()> {
        insert_with(self.connection.pool(), self.dialect(), name, value).await?;
        Ok(())
    }

    /// Applied migrations, in the order they were recorded.
    pub async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.values(MIGRATION_KEY)
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Into::into))
            .collect()
    }

    /// Id of the most recent applied script, by id order.
    pub async fn last_applied(&self) -> Result<Option<String>> {
        last_applied_of(&self.values(MIGRATION_KEY).await?)
    }

    /// Records a script as applied.
    pub async fn record_applied(&self, record: &MigrationRecord) -> Result<()> {
        self.append(MIGRATION_KEY, &serde_json::to_string(record)?).await
    }

    /// Records a failure marker.
    pub async fn record_failure(&self, failure: &FailureRecord) -> Result<()> {
        self.append(FAILURE_KEY, &serde_json::to_string(failure)?).await
    }

    /// Marks every failure of script `id` recorded so far as resolved.
    pub async fn resolve(&self, id: &str) -> Result<()> {
        self.append(RESOLVED_KEY, id).await
    }

    /// Failures not followed by a resolution of the same script, by id.
    pub async fn unresolved_failures(&self) -> Result<Vec<FailureRecord>> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT {name}, {value} FROM {table} WHERE {name} IN ({p1}, {p2}) ORDER BY {id}",
            name = dialect.quote_identifier("name"),
            value = dialect.quote_identifier("value"),
            table = dialect.quote_identifier(METADATA_TABLE),
            id = dialect.quote_identifier("id"),
            p1 = dialect.placeholder(1),
            p2 = dialect.placeholder(2),
        );
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&sql)
            .bind(FAILURE_KEY.to_string())
            .bind(RESOLVED_KEY.to_string())
            .fetch_all(self.connection.pool())
            .await?;

        let mut open: BTreeMap<String, FailureRecord> = BTreeMap::new();
        for (name, value) in rows {
            let value = value.unwrap_or_default();
            if name == FAILURE_KEY {
                let failure: FailureRecord = serde_json::from_str(&value)?;
                open.insert(failure.id.clone(), failure);
            } else {
                open.remove(&value);
            }
        }
        Ok(open.into_values().collect())
    }

    /// When the schema was last built from scratch.
    pub async fn built_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get(BUILT_AT_KEY)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    /// Stamps the time of a full schema build.
    pub async fn stamp_built(&self, at: DateTime<Utc>) -> Result<()> {
        self.set(BUILT_AT_KEY, &at.to_rfc3339()).await
    }
}
