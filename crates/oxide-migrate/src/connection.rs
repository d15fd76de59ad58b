//! Connections to data sources.
//!
//! A [`ConnectionManager`] owns the registered data sources and lazily opens
//! one [`Connection`] per id. Connections are cheap handles; cloning one
//! shares the underlying pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use oxide_schema::datasource::{
    DataSource, DataSourceConfig, DataSourcesConfig, DEFAULT_DATA_SOURCE, INIT_COMMAND,
};
use oxide_schema::dialect::{Dialect, Driver};
use oxide_schema::schema::TableSchema;
use oxide_schema::SchemaError;
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Executor, Transaction};
use tracing::{debug, info};
use url::Url;

use crate::error::{MigrateError, Result};

/// Connection option bounding how long acquiring the handle may take, in
/// seconds.
pub const CONNECT_TIMEOUT: &str = "timeout";

/// An open connection to one data source.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    driver: Driver,
    pool: AnyPool,
    query_options: BTreeMap<String, String>,
}

impl Connection {
    /// Opens a connection to `source`.
    ///
    /// The `init_command` connection option, if any, runs on every new
    /// session before it is handed out.
    pub async fn open(source: &DataSource) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let url = connect_url(source)?;
        let init_command = source.connection_options.get(INIT_COMMAND).cloned();
        let timeout = match source.connection_options.get(CONNECT_TIMEOUT) {
            Some(value) => value.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                SchemaError::config(&source.id, format!("invalid timeout '{value}'"))
            })?,
            None => Duration::from_secs(30),
        };

        // A single long-lived session keeps `:memory:` SQLite databases alive
        // and gives every statement the same session state.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(timeout)
            .after_connect(move |conn, _meta| {
                let init_command = init_command.clone();
                Box::pin(async move {
                    if let Some(sql) = init_command {
                        conn.execute(sql.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .map_err(|source_err| MigrateError::Connection {
                id: source.id.clone(),
                source: source_err,
            })?;

        info!(id = %source.id, driver = %source.driver, "Opened connection");

        Ok(Self {
            inner: Arc::new(Inner {
                id: source.id.clone(),
                driver: source.driver,
                pool,
                query_options: source.query_options.clone(),
            }),
        })
    }

    /// Data source id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Driver of the data source.
    #[must_use]
    pub fn driver(&self) -> Driver {
        self.inner.driver
    }

    /// SQL dialect of the data source.
    #[must_use]
    pub fn dialect(&self) -> &'static dyn Dialect {
        self.inner.driver.dialect()
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.inner.pool
    }

    /// Options applied to queries issued on this connection.
    #[must_use]
    pub fn query_options(&self) -> &BTreeMap<String, String> {
        &self.inner.query_options
    }

    /// Whether both handles share the same underlying session.
    #[must_use]
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Executes one statement and returns the number of affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(id = %self.inner.id, sql = %sql, "Executing SQL");
        self.inner
            .pool
            .execute(sql)
            .await
            .map(|done| done.rows_affected())
            .map_err(|source| MigrateError::Execution {
                sql: sql.to_string(),
                source,
            })
    }

    /// Executes statements in order, stopping at the first failure.
    pub async fn execute_all(&self, statements: &[String]) -> Result<()> {
        for sql in statements {
            self.execute(sql).await?;
        }
        Ok(())
    }

    /// Starts a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Any>> {
        Ok(self.inner.pool.begin().await?)
    }

    /// Closes the underlying session. Other clones of this handle become
    /// unusable.
    pub async fn close(&self) {
        self.inner.pool.close().await;
        info!(id = %self.inner.id, "Closed connection");
    }

    /// Whether the handle was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }
}

/// Builds the URL the driver connects with.
///
/// SQLite file databases are created when missing. Credentials given
/// separately are filled in only when the DSN does not carry its own.
pub fn connect_url(source: &DataSource) -> Result<String> {
    let invalid = |message: String| MigrateError::from(SchemaError::config(&source.id, message));
    let dsn = &source.dsn;

    if source.driver == Driver::Sqlite {
        let body = dsn.body().trim();
        let path = body.strip_prefix("//").unwrap_or(body);
        return Ok(if path.is_empty() || path == ":memory:" {
            "sqlite::memory:".to_string()
        } else if path.contains('?') {
            format!("sqlite:{path}")
        } else {
            format!("sqlite:{path}?mode=rwc")
        });
    }

    let scheme = source.driver.url_scheme();
    let mut url = if dsn.is_url() {
        Url::parse(&format!("{scheme}:{}", dsn.body()))
            .map_err(|e| invalid(format!("invalid DSN: {e}")))?
    } else {
        let attributes = dsn.attributes();
        let host = attributes.get("host").map_or("localhost", String::as_str);
        let mut url = Url::parse(&format!("{scheme}://{host}"))
            .map_err(|e| invalid(format!("invalid host '{host}': {e}")))?;
        if let Some(port) = attributes.get("port") {
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid(format!("invalid port '{port}'")))?;
            url.set_port(Some(port))
                .map_err(|()| invalid("port cannot be set".to_string()))?;
        }
        if let Some(database) = attributes.get("dbname") {
            url.set_path(database);
        }
        if let Some(charset) = attributes.get("charset") {
            url.query_pairs_mut().append_pair("charset", charset);
        }
        url
    };

    if url.username().is_empty() {
        if let Some(user) = &source.user {
            url.set_username(user)
                .map_err(|()| invalid("user cannot be set".to_string()))?;
        }
    }
    if url.password().is_none() {
        if let Some(pass) = &source.pass {
            url.set_password(Some(pass))
                .map_err(|()| invalid("password cannot be set".to_string()))?;
        }
    }

    Ok(url.into())
}

/// Errors worth retrying: the request may succeed on a second attempt.
pub(crate) const fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

/// Registry of data sources and their open connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    sources: BTreeMap<String, DataSource>,
    connections: BTreeMap<String, Connection>,
    master: Option<String>,
}

impl ConnectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager from a data sources configuration.
    pub fn from_config(config: &DataSourcesConfig) -> Result<Self> {
        let mut manager = Self::new();
        for source in config.normalize_all()? {
            manager.register(source)?;
        }
        if let Some(master) = &config.default {
            manager.set_master(master)?;
        }
        Ok(manager)
    }

    /// Normalizes `config` and registers it under `id`.
    pub fn add_data_source(&mut self, id: &str, config: &DataSourceConfig) -> Result<()> {
        if self.sources.contains_key(id) {
            return Err(MigrateError::DuplicateDataSource(id.to_string()));
        }
        self.register(config.normalize(id)?)
    }

    /// Registers a normalized data source. Nothing is opened until it is
    /// first used.
    pub fn register(&mut self, source: DataSource) -> Result<()> {
        if self.sources.contains_key(&source.id) {
            return Err(MigrateError::DuplicateDataSource(source.id));
        }
        debug!(id = %source.id, driver = %source.driver, "Registered data source");
        self.sources.insert(source.id.clone(), source);
        Ok(())
    }

    /// Unregisters a data source, closing its connection if open.
    pub async fn remove_data_source(&mut self, id: &str) -> Result<DataSource> {
        let source = self
            .sources
            .remove(id)
            .ok_or_else(|| MigrateError::UnknownDataSource(id.to_string()))?;
        if let Some(connection) = self.connections.remove(id) {
            connection.close().await;
        }
        if self.master.as_deref() == Some(id) {
            self.master = None;
        }
        Ok(source)
    }

    /// Makes `id` the data source `"default"` resolves to.
    pub fn set_master(&mut self, id: &str) -> Result<()> {
        if !self.sources.contains_key(id) {
            return Err(MigrateError::UnknownDataSource(id.to_string()));
        }
        self.master = Some(id.to_string());
        Ok(())
    }

    /// Id `"default"` currently resolves to.
    #[must_use]
    pub fn master_id(&self) -> &str {
        self.master.as_deref().unwrap_or(DEFAULT_DATA_SOURCE)
    }

    /// Resolves the `"default"` alias; other ids are returned as is.
    #[must_use]
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        if id == DEFAULT_DATA_SOURCE {
            self.master_id()
        } else {
            id
        }
    }

    /// Registered data source ids, in order.
    pub fn data_source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Looks up a data source, resolving `"default"`.
    #[must_use]
    pub fn data_source(&self, id: &str) -> Option<&DataSource> {
        self.sources.get(self.resolve(id))
    }

    /// Returns the connection for `id`, opening it on first use.
    ///
    /// Later calls return the same handle until it is closed.
    pub async fn get_connection(&mut self, id: &str) -> Result<Connection> {
        let id = self.resolve(id).to_string();
        if let Some(connection) = self.connections.get(&id) {
            return Ok(connection.clone());
        }
        let source = self
            .sources
            .get(&id)
            .ok_or_else(|| MigrateError::UnknownDataSource(id.clone()))?;
        let connection = Connection::open(source).await?;
        self.connections.insert(id, connection.clone());
        Ok(connection)
    }

    /// Connection used to read from `table`.
    pub async fn read_connection(&mut self, table: &TableSchema) -> Result<Connection> {
        self.get_connection(&table.route.read).await
    }

    /// Connection used to write to, and run DDL on, `table`.
    pub async fn write_connection(&mut self, table: &TableSchema) -> Result<Connection> {
        self.get_connection(&table.route.write).await
    }

    /// Connection of one shard of a sharded table, registered as
    /// `<write source>_<shard>`.
    pub async fn shard_connection(&mut self, table: &TableSchema, shard: &str) -> Result<Connection> {
        if table.route.shard_key.is_none() {
            return Err(SchemaError::validation(&table.name, "table is not sharded").into());
        }
        let base = self.resolve(&table.route.write).to_string();
        self.get_connection(&format!("{base}_{shard}")).await
    }

    /// Closes the connection for `id`. Returns whether one was open.
    pub async fn close(&mut self, id: &str) -> bool {
        let id = self.resolve(id).to_string();
        match self.connections.remove(&id) {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every open connection.
    pub async fn close_all(&mut self) {
        for (_, connection) in std::mem::take(&mut self.connections) {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use oxide_schema::schema::Route;

    use super::*;

    fn memory(id: &str) -> DataSource {
        DataSourceConfig::from_dsn("sqlite::memory:")
            .normalize(id)
            .unwrap()
    }

    #[test]
    fn test_connect_url_sqlite() {
        assert_eq!(connect_url(&memory("a")).unwrap(), "sqlite::memory:");

        let file = DataSourceConfig::from_dsn("sqlite:/tmp/app.db")
            .normalize("a")
            .unwrap();
        assert_eq!(connect_url(&file).unwrap(), "sqlite:/tmp/app.db?mode=rwc");

        let built = DataSourceConfig::default()
            .driver("sqlite")
            .normalize("a")
            .unwrap();
        assert_eq!(connect_url(&built).unwrap(), "sqlite::memory:");
    }

    #[test]
    fn test_connect_url_from_attributes() {
        let source = DataSourceConfig::from_dsn("pgsql:host=db;port=5433;dbname=app")
            .credentials("app", "s3cret")
            .normalize("main")
            .unwrap();
        assert_eq!(
            connect_url(&source).unwrap(),
            "postgres://app:s3cret@db:5433/app"
        );
    }

    #[test]
    fn test_connect_url_keeps_url_credentials() {
        let source = DataSourceConfig::from_dsn("mysql://root:pw@localhost/shop")
            .credentials("other", "ignored")
            .normalize("main")
            .unwrap();
        assert_eq!(
            connect_url(&source).unwrap(),
            "mysql://root:pw@localhost/shop"
        );
    }

    #[test]
    fn test_connect_url_rejects_bad_port() {
        let source = DataSourceConfig::from_dsn("mysql:host=db;port=abc")
            .normalize("main")
            .unwrap();
        assert!(matches!(
            connect_url(&source).unwrap_err(),
            MigrateError::Schema(SchemaError::ConfigValidation { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_is_cached() {
        let mut manager = ConnectionManager::new();
        manager.register(memory("default")).unwrap();

        let first = manager.get_connection("default").await.unwrap();
        let second = manager.get_connection("default").await.unwrap();
        assert!(first.same_handle(&second));

        assert!(manager.close("default").await);
        assert!(first.is_closed());
        let third = manager.get_connection("default").await.unwrap();
        assert!(!first.same_handle(&third));
        assert!(!third.is_closed());

        manager.close_all().await;
        assert!(third.is_closed());
    }

    #[tokio::test]
    async fn test_add_data_source_normalizes_config() {
        let mut manager = ConnectionManager::new();
        let config = DataSourceConfig::from_dsn("sqlite::memory:");
        manager.add_data_source("main", &config).unwrap();
        assert_eq!(manager.data_source("main").unwrap().driver, Driver::Sqlite);
        assert!(matches!(
            manager.add_data_source("main", &config),
            Err(MigrateError::DuplicateDataSource(id)) if id == "main"
        ));
        assert!(matches!(
            manager.add_data_source("broken", &DataSourceConfig::default()),
            Err(MigrateError::Schema(SchemaError::ConfigValidation { .. }))
        ));
        assert!(!manager.data_source_ids().any(|id| id == "broken"));
    }

    #[tokio::test]
    async fn test_default_resolves_to_master() {
        let mut manager = ConnectionManager::new();
        manager.register(memory("primary")).unwrap();
        manager.register(memory("replica")).unwrap();
        manager.set_master("primary").unwrap();

        let default = manager.get_connection("default").await.unwrap();
        let primary = manager.get_connection("primary").await.unwrap();
        let replica = manager.get_connection("replica").await.unwrap();
        assert!(default.same_handle(&primary));
        assert!(!default.same_handle(&replica));
        assert_eq!(default.id(), "primary");
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_sources() {
        let mut manager = ConnectionManager::new();
        manager.register(memory("a")).unwrap();

        assert!(matches!(
            manager.register(memory("a")),
            Err(MigrateError::DuplicateDataSource(id)) if id == "a"
        ));
        assert!(matches!(
            manager.get_connection("b").await,
            Err(MigrateError::UnknownDataSource(id)) if id == "b"
        ));
        assert!(manager.set_master("b").is_err());
    }

    #[tokio::test]
    async fn test_routes_and_shards() {
        let mut manager = ConnectionManager::new();
        manager.register(memory("reads")).unwrap();
        manager.register(memory("writes")).unwrap();
        manager.register(memory("writes_2")).unwrap();

        let table = TableSchema::new("events").route(Route {
            read: "reads".into(),
            write: "writes".into(),
            shard_key: Some("tenant_id".into()),
        });

        assert_eq!(manager.read_connection(&table).await.unwrap().id(), "reads");
        assert_eq!(manager.write_connection(&table).await.unwrap().id(), "writes");
        assert_eq!(
            manager.shard_connection(&table, "2").await.unwrap().id(),
            "writes_2"
        );
        assert!(matches!(
            manager.shard_connection(&table, "3").await,
            Err(MigrateError::UnknownDataSource(_))
        ));

        let unsharded = TableSchema::new("users");
        assert!(manager.shard_connection(&unsharded, "2").await.is_err());
    }

    #[tokio::test]
    async fn test_init_command_runs_on_connect() {
        let mut config = DataSourceConfig::from_dsn("sqlite::memory:");
        config
            .connection_options
            .insert(INIT_COMMAND.to_string(), "CREATE TABLE boot (x INTEGER)".to_string());
        let source = config.normalize("default").unwrap();
        let connection = Connection::open(&source).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'boot'",
        )
        .fetch_one(connection.pool())
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_from_config_and_remove() {
        let config: DataSourcesConfig = serde_json::from_str(
            r#"{"default": "main", "nodes": {"main": {"dsn": "sqlite::memory:"}}}"#,
        )
        .unwrap();
        let mut manager = ConnectionManager::from_config(&config).unwrap();
        assert_eq!(manager.master_id(), "main");
        assert_eq!(manager.data_source_ids().collect::<Vec<_>>(), vec!["main"]);

        let connection = manager.get_connection("default").await.unwrap();
        assert_eq!(connection.id(), "main");

        manager.remove_data_source("main").await.unwrap();
        assert!(connection.is_closed());
        assert_eq!(manager.master_id(), "default");
        assert!(manager.data_source("main").is_none());
    }

    #[tokio::test]
    async fn test_execute_reports_sql() {
        let connection = Connection::open(&memory("a")).await.unwrap();
        connection
            .execute_all(&["CREATE TABLE t (x INTEGER)".to_string()])
            .await
            .unwrap();
        let err = connection.execute("INSERT INTO missing VALUES (1)").await.unwrap_err();
        assert!(matches!(err, MigrateError::Execution { ref sql, .. } if sql.contains("missing")));
    }
}
