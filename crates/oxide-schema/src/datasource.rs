//! Data source descriptions.
//!
//! A data source is a named connection target. [`DataSourceConfig`] is the
//! loose shape read from configuration files; [`DataSource`] is the
//! normalized form the connection layer consumes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dialect::Driver;
use crate::error::{Result, SchemaError};

/// Connection option holding the statement run on every new MySQL session.
pub const INIT_COMMAND: &str = "init_command";

/// Data source id used when none is given.
pub const DEFAULT_DATA_SOURCE: &str = "default";

/// A PDO-style DSN such as `mysql:host=localhost;dbname=app` or
/// `sqlite::memory:`. URL bodies (`pgsql://...`) are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dsn {
    prefix: String,
    body: String,
}

impl Dsn {
    /// Parses a DSN. The part before the first `:` names the driver.
    pub fn parse(dsn: &str) -> Result<Self> {
        let (prefix, body) = dsn
            .split_once(':')
            .ok_or_else(|| SchemaError::config(dsn, "DSN has no driver prefix"))?;
        if prefix.trim().is_empty() {
            return Err(SchemaError::config(dsn, "DSN has an empty driver prefix"));
        }
        Ok(Self {
            prefix: prefix.trim().to_ascii_lowercase(),
            body: body.to_string(),
        })
    }

    /// Builds a DSN from discrete attributes, in `dbname`, `host`, `port` order.
    #[must_use]
    pub fn build(
        driver: Driver,
        database: Option<&str>,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Self {
        let body = if driver == Driver::Sqlite {
            database.unwrap_or(":memory:").to_string()
        } else {
            let mut attributes = Vec::new();
            if let Some(database) = database {
                attributes.push(format!("dbname={database}"));
            }
            if let Some(host) = host {
                attributes.push(format!("host={host}"));
            }
            if let Some(port) = port {
                attributes.push(format!("port={port}"));
            }
            attributes.join(";")
        };
        Self {
            prefix: driver.name().to_string(),
            body,
        }
    }

    /// The driver prefix as written.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Everything after the driver prefix.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Resolves the driver named by the prefix.
    pub fn driver(&self) -> Result<Driver> {
        Driver::from_str(&self.prefix)
    }

    /// Whether the body is URL-shaped (`//user@host/db`).
    #[must_use]
    pub fn is_url(&self) -> bool {
        self.body.starts_with("//")
    }

    /// `key=value` attributes of the body. Empty for URL and SQLite bodies.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, String> {
        if self.is_url() {
            return BTreeMap::new();
        }
        self.body
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect()
    }

    /// One attribute, looked up case-insensitively.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes().remove(&key.to_ascii_lowercase())
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.body)
    }
}

impl Serialize for Dsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A data source as written in configuration.
///
/// Either `driver` or `dsn` must be given; everything else is optional.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Driver name (`sqlite`, `pgsql`, `mysql`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// PDO-style DSN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    /// Host, used to build a DSN when none is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Port, used to build a DSN when none is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name (or file path for SQLite).
    #[serde(default, alias = "dbname", skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// User name.
    #[serde(default, alias = "username")]
    pub user: Option<String>,
    /// Password.
    #[serde(default, alias = "password")]
    pub pass: Option<String>,
    /// Options applied when connecting.
    #[serde(default)]
    pub connection_options: BTreeMap<String, String>,
    /// Options applied to queries issued on the connection.
    #[serde(default)]
    pub query_options: BTreeMap<String, String>,
}

impl DataSourceConfig {
    /// Creates a configuration from a DSN.
    #[must_use]
    pub fn from_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    /// Sets the driver name.
    #[must_use]
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Sets host and port.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    /// Sets the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Validates and fills in defaults.
    pub fn normalize(&self, id: &str) -> Result<DataSource> {
        let parsed = self.dsn.as_deref().map(Dsn::parse).transpose()?;
        let from_dsn = parsed.as_ref().map(Dsn::driver).transpose()?;
        let declared = self.driver.as_deref().map(Driver::from_str).transpose()?;

        let driver = match (declared, from_dsn) {
            (Some(declared), Some(from_dsn)) if declared != from_dsn => {
                return Err(SchemaError::config(
                    id,
                    format!(
                        "driver '{}' does not match DSN prefix '{}'",
                        self.driver.as_deref().unwrap_or_default(),
                        parsed.as_ref().map(Dsn::prefix).unwrap_or_default()
                    ),
                ));
            }
            (Some(driver), _) | (None, Some(driver)) => driver,
            (None, None) => {
                return Err(SchemaError::config(id, "neither driver nor dsn is given"));
            }
        };

        let dsn = match parsed {
            Some(dsn) => dsn,
            None => {
                if driver != Driver::Sqlite && self.database.is_none() && self.host.is_none() {
                    return Err(SchemaError::config(
                        id,
                        "no dsn, host or database to connect to",
                    ));
                }
                Dsn::build(
                    driver,
                    self.database.as_deref(),
                    self.host.as_deref(),
                    self.port,
                )
            }
        };

        let mut connection_options = self.connection_options.clone();
        if driver == Driver::MySql {
            connection_options
                .entry(INIT_COMMAND.to_string())
                .or_insert_with(|| "SET NAMES utf8mb4".to_string());
        }

        Ok(DataSource {
            id: id.to_string(),
            driver,
            dsn,
            user: self.user.clone().filter(|u| !u.is_empty()),
            pass: self.pass.clone().filter(|p| !p.is_empty()),
            connection_options,
            query_options: self.query_options.clone(),
        })
    }
}

/// A normalized data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSource {
    /// Data source id.
    pub id: String,
    /// Resolved driver.
    pub driver: Driver,
    /// DSN, built from the discrete attributes when none was given.
    pub dsn: Dsn,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub pass: Option<String>,
    /// Options applied when connecting.
    pub connection_options: BTreeMap<String, String>,
    /// Options applied to queries issued on the connection.
    pub query_options: BTreeMap<String, String>,
}

/// All data sources of an application, as handed over by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataSourcesConfig {
    /// Id of the master data source that `"default"` resolves to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Data sources keyed by id.
    #[serde(default, alias = "data_sources")]
    pub nodes: BTreeMap<String, DataSourceConfig>,
}

impl DataSourcesConfig {
    /// Id `"default"` resolves to.
    #[must_use]
    pub fn master_id(&self) -> &str {
        self.default.as_deref().unwrap_or(DEFAULT_DATA_SOURCE)
    }

    /// Normalizes every data source, failing on the first invalid one.
    pub fn normalize_all(&self) -> Result<Vec<DataSource>> {
        self.nodes
            .iter()
            .map(|(id, config)| config.normalize(id))
            .collect()
    }
}
