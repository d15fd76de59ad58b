//! Building a database from scratch.

use chrono::Utc;
use oxide_schema::compiler::{CompileOptions, SchemaCompiler};
use oxide_schema::registry::SchemaRegistry;
use tracing::info;

use crate::connection::Connection;
use crate::error::Result;
use crate::metadata::MetadataStore;

/// Creates every table of a registry on one connection.
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    connection: Connection,
    options: CompileOptions,
    dry_run: bool,
}

impl DatabaseBuilder {
    /// Creates a builder with default compile options.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            options: CompileOptions::default(),
            dry_run: false,
        }
    }

    /// Sets the compile options.
    #[must_use]
    pub const fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables dry-run mode (SQL is printed but not executed).
    #[must_use]
    pub const fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Statements a build would run.
    pub fn sql(&self, registry: &SchemaRegistry) -> Result<Vec<String>> {
        Ok(SchemaCompiler::new(self.connection.dialect())
            .with_options(self.options)
            .compile_all(registry)?)
    }

    /// Creates every table and stamps the build time in the metadata table.
    ///
    /// The whole registry is validated before the first statement runs.
    /// Returns the statements executed (or printed, in dry-run mode).
    pub async fn build(&self, registry: &SchemaRegistry) -> Result<Vec<String>> {
        let statements = self.sql(registry)?;

        if self.dry_run {
            for sql in &statements {
                println!("{sql};");
            }
            return Ok(statements);
        }

        self.connection.execute_all(&statements).await?;

        let metadata = MetadataStore::new(self.connection.clone());
        metadata.ensure_table().await?;
        metadata.stamp_built(Utc::now()).await?;

        info!(
            id = %self.connection.id(),
            tables = registry.len(),
            statements = statements.len(),
            "Built database schema"
        );
        Ok(statements)
    }
}
