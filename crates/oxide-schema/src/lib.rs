//! Declarative relational schemas for Rust.
//!
//! `oxide-schema` is the I/O-free half of the toolkit:
//! - Tables are declared as plain data ([`TableSchema`], [`Column`]) and can
//!   be loaded from JSON
//! - Mixins and locale variants are flattened once, with last-writer-wins
//!   collisions, against a [`SchemaRegistry`]
//! - DDL is compiled per dialect (SQLite, PostgreSQL, MySQL) and is
//!   byte-for-byte deterministic
//! - Declared and live schemas are diffed into ordered, executable reports
//!
//! The database-facing half (connections, introspection, migrations) lives
//! in `oxide-migrate`.
//!
//! # Example
//!
//! ```rust
//! use oxide_schema::prelude::*;
//!
//! let registry = SchemaRegistry::new()
//!     .mixin(
//!         MixinSchema::new("timestamps")
//!             .column(Column::new("created_at", ColumnType::DateTime).not_null()),
//!     )
//!     .table(
//!         TableSchema::new("users")
//!             .column(Column::new("email", ColumnType::Str).length(255).not_null().unique())
//!             .column(Column::new("display_name", ColumnType::Str).as_virtual())
//!             .mixin("timestamps"),
//!     );
//!
//! let statements = SchemaCompiler::new(Driver::Sqlite.dialect())
//!     .compile_all(&registry)
//!     .unwrap();
//! assert!(statements[0].starts_with("CREATE TABLE \"users\""));
//! assert!(!statements[0].contains("display_name"));
//! ```

pub mod compiler;
pub mod datasource;
pub mod dialect;
pub mod diff;
pub mod error;
pub mod registry;
pub mod schema;

pub use error::{Result, SchemaError};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::compiler::{CompileOptions, SchemaCompiler};
    pub use crate::datasource::{DataSource, DataSourceConfig, DataSourcesConfig, Dsn};
    pub use crate::dialect::{
        ColumnChange, Dialect, Driver, MySqlDialect, PostgresDialect, SqliteDialect,
    };
    pub use crate::diff::{
        DatabaseDiff, DiffEntry, DiffOperation, DiffReport, DiffWarning, ModifyPolicy,
        SchemaDiffEngine,
    };
    pub use crate::error::{Result, SchemaError};
    pub use crate::registry::{RegistryFile, SchemaRegistry, METADATA_TABLE};
    pub use crate::schema::{
        Column, ColumnType, DefaultValue, ForeignKeyAction, IndexSchema, MixinSchema,
        Reference, Route, TableSchema,
    };
}
