//! DDL compilation.
//!
//! Turns expanded, validated table schemas into the ordered list of
//! statements that create them on a given dialect.

use tracing::debug;

use crate::dialect::{CreateOptions, Dialect};
use crate::error::{Result, SchemaError};
use crate::registry::SchemaRegistry;
use crate::schema::TableSchema;

/// Options for [`SchemaCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Emit `DROP TABLE IF EXISTS` before creating each table.
    pub clean: bool,
    /// Emit `IF NOT EXISTS` on tables and indexes.
    pub if_not_exists: bool,
    /// Emit foreign key constraints for references.
    pub foreign_keys: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            clean: false,
            if_not_exists: false,
            foreign_keys: true,
        }
    }
}

impl CompileOptions {
    /// Drops tables before recreating them.
    #[must_use]
    pub const fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Guards creation with `IF NOT EXISTS`.
    #[must_use]
    pub const fn if_not_exists(mut self, if_not_exists: bool) -> Self {
        self.if_not_exists = if_not_exists;
        self
    }

    /// Enables or disables foreign key constraints.
    #[must_use]
    pub const fn foreign_keys(mut self, foreign_keys: bool) -> Self {
        self.foreign_keys = foreign_keys;
        self
    }
}

/// Compiles table schemas to DDL for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct SchemaCompiler<'a> {
    dialect: &'a dyn Dialect,
    options: CompileOptions,
}

impl<'a> SchemaCompiler<'a> {
    /// Creates a compiler with default options.
    #[must_use]
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            options: CompileOptions::default(),
        }
    }

    /// Sets the compile options.
    #[must_use]
    pub const fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the dialect.
    #[must_use]
    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    /// Compiles one table.
    ///
    /// A table that has not been expanded yet is expanded on a copy; it must
    /// not name any mixin since there is no registry to resolve them. Either
    /// every statement is produced or an error is returned.
    pub fn compile(&self, table: &TableSchema) -> Result<Vec<String>> {
        if table.is_expanded() {
            table.validate()?;
            self.emit(table)
        } else {
            if !table.mixins.is_empty() {
                return Err(SchemaError::validation(
                    &table.name,
                    "mixins must be expanded through a registry before compiling",
                ));
            }
            let mut expanded = table.clone();
            expanded.expand_with(|_| None)?;
            expanded.validate()?;
            self.emit(&expanded)
        }
    }

    /// Compiles every table of the registry, referenced tables first.
    ///
    /// All tables are validated before any statement is produced.
    pub fn compile_all(&self, registry: &SchemaRegistry) -> Result<Vec<String>> {
        let tables = registry
            .dependency_order()
            .into_iter()
            .map(|name| registry.prepare(name))
            .collect::<Result<Vec<_>>>()?;

        let mut statements = Vec::new();
        for table in &tables {
            statements.extend(self.emit(table)?);
        }
        Ok(statements)
    }

    fn emit(&self, table: &TableSchema) -> Result<Vec<String>> {
        let dialect = self.dialect;
        let mut statements = Vec::new();

        if self.options.clean {
            statements.push(dialect.drop_table(&table.name, true));
        }

        let create = CreateOptions {
            if_not_exists: self.options.if_not_exists,
            foreign_keys: self.options.foreign_keys,
        };
        statements.push(dialect.create_table(table, create)?);

        for index in table.index_definitions() {
            statements.push(dialect.create_index(&table.name, &index, self.options.if_not_exists));
        }

        statements.extend(dialect.post_create(table));

        debug!(
            table = %table.name,
            dialect = dialect.name(),
            statements = statements.len(),
            "Compiled table"
        );
        Ok(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Driver, PostgresDialect, SqliteDialect};
    use crate::schema::{Column, ColumnType, IndexSchema, MixinSchema, Reference};

    fn users() -> TableSchema {
        TableSchema::new("users")
            .column(Column::new("email", ColumnType::Str).length(255).not_null().indexed())
            .column(Column::new("display", ColumnType::Str).as_virtual())
            .index(IndexSchema::new("uniq_users_email", ["email"]).unique())
    }

    #[test]
    fn test_compile_order() {
        let dialect = SqliteDialect::new();
        let compiler = SchemaCompiler::new(&dialect)
            .with_options(CompileOptions::default().clean(true));

        let statements = compiler.compile(&users()).unwrap();
        assert_eq!(statements.len(), 4);
        assert_eq!(statements[0], "DROP TABLE IF EXISTS \"users\"");
        assert!(statements[1].starts_with("CREATE TABLE \"users\""));
        assert_eq!(
            statements[2],
            "CREATE INDEX \"idx_users_email\" ON \"users\" (\"email\")"
        );
        assert_eq!(
            statements[3],
            "CREATE UNIQUE INDEX \"uniq_users_email\" ON \"users\" (\"email\")"
        );
    }

    #[test]
    fn test_virtual_columns_are_not_persisted() {
        let dialect = SqliteDialect::new();
        let statements = SchemaCompiler::new(&dialect).compile(&users()).unwrap();
        assert!(!statements[0].contains("display"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let dialect = PostgresDialect::new();
        let compiler = SchemaCompiler::new(&dialect);
        assert_eq!(
            compiler.compile(&users()).unwrap(),
            compiler.compile(&users()).unwrap()
        );
    }

    #[test]
    fn test_unsupported_type_produces_no_partial_output() {
        let table = TableSchema::new("flags")
            .column(Column::new("state", ColumnType::Enum).values(["on", "off"]));
        let compiler = SchemaCompiler::new(Driver::Postgres.dialect());

        let err = compiler.compile(&table).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedDialect { .. }));
    }

    #[test]
    fn test_unexpanded_mixins_are_rejected() {
        let table = TableSchema::new("posts").mixin("timestamps");
        let compiler = SchemaCompiler::new(Driver::Sqlite.dialect());
        assert!(compiler.compile(&table).is_err());
    }

    #[test]
    fn test_compile_all_orders_by_reference() {
        let registry = SchemaRegistry::new()
            .mixin(
                MixinSchema::new("timestamps")
                    .column(Column::new("created_at", ColumnType::DateTime)),
            )
            .table(
                TableSchema::new("books")
                    .column(Column::new("author_id", ColumnType::Int))
                    .reference(Reference::new("author_id", "writers"))
                    .mixin("timestamps"),
            )
            .table(TableSchema::new("writers").column(Column::new("name", ColumnType::Text)));

        let compiler = SchemaCompiler::new(Driver::Sqlite.dialect());
        let statements = compiler.compile_all(&registry).unwrap();

        assert!(statements[0].starts_with("CREATE TABLE \"writers\""));
        assert!(statements[1].starts_with("CREATE TABLE \"books\""));
        assert!(statements[1].contains("\"created_at\" TEXT"));
        assert!(statements[1].contains("REFERENCES \"writers\" (\"id\")"));
    }

    #[test]
    fn test_registry_validation_fails_before_output() {
        let registry = SchemaRegistry::new()
            .table(TableSchema::new("a").column(Column::new("x", ColumnType::Int)))
            .table(
                TableSchema::new("b")
                    .column(Column::new("y", ColumnType::Int))
                    .reference(Reference::new("y", "missing")),
            );
        let compiler = SchemaCompiler::new(Driver::Sqlite.dialect());
        assert!(compiler.compile_all(&registry).is_err());
    }
}
