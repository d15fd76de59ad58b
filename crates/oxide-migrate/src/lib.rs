//! Connections, introspection and migrations for `oxide-schema`.
//!
//! `oxide-migrate` is the database-facing half of the toolkit:
//! - [`ConnectionManager`](connection::ConnectionManager) keeps one handle
//!   per data source and resolves `"default"` to the master source
//! - [`TableIntrospector`](introspect::TableIntrospector) reads live tables
//!   back into [`TableSchema`](oxide_schema::schema::TableSchema)s
//! - [`MigrationManager`](migration::MigrationManager) generates scripts
//!   from schema diffs and applies them, one transaction per script
//! - [`DatabaseBuilder`](builder::DatabaseBuilder) creates a whole registry
//!   from scratch
//!
//! Bookkeeping lives in the `__meta__` table of each database.
//!
//! # Example
//!
//! ```rust,no_run
//! use oxide_migrate::prelude::*;
//! use oxide_schema::prelude::*;
//!
//! # async fn run() -> oxide_migrate::error::Result<()> {
//! let mut connections = ConnectionManager::new();
//! connections.add_data_source("default", &DataSourceConfig::from_dsn("sqlite:app.db"))?;
//! let connection = connections.get_connection("default").await?;
//!
//! let registry = SchemaRegistry::new().table(
//!     TableSchema::new("users")
//!         .column(Column::new("email", ColumnType::Str).length(255).not_null().unique()),
//! );
//!
//! let mut migrations = MigrationManager::new(connection).with_directory("migrations");
//! migrations.load()?;
//! migrations.generate_with_diff(&registry, "add users").await?;
//! migrations.upgrade().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Print the DDL of a schema file
//! oxide-migrate --schema schema.json sql
//!
//! # Write a migration script for the differences with the live database
//! oxide-migrate --schema schema.json migrate diff "add users"
//!
//! # Apply pending scripts
//! oxide-migrate migrate up
//! ```

pub mod builder;
pub mod connection;
pub mod error;
pub mod introspect;
pub mod metadata;
pub mod migration;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::builder::DatabaseBuilder;
    pub use crate::connection::{Connection, ConnectionManager};
    pub use crate::error::{ExitStatus, MigrateError, Result};
    pub use crate::introspect::TableIntrospector;
    pub use crate::metadata::{FailureRecord, FailureState, MetadataStore, MigrationRecord};
    pub use crate::migration::{
        MigrationManager, MigrationScript, ScriptState, ScriptStatus, StatusReport,
    };
}
