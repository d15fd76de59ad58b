//! Schema diff engine.
//!
//! Compares a declared [`TableSchema`] with an actual one (introspected from
//! a live database, or a previous declared version) and produces an ordered
//! [`DiffReport`] of the DDL needed to move from actual to declared.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compiler::{CompileOptions, SchemaCompiler};
use crate::dialect::{ColumnChange, CreateOptions, Dialect};
use crate::error::Result;
use crate::registry::{SchemaRegistry, METADATA_TABLE};
use crate::schema::{Column, IndexSchema, TableSchema};

/// Kind of change in a [`DiffEntry`].
///
/// Variants are declared in emission order, so sorting by operation gives
/// the order a report is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiffOperation {
    /// Column present only in the declared schema.
    AddColumn,
    /// Column present on both sides with a material difference.
    ModifyColumn,
    /// Column present only in the actual schema.
    DropColumn,
    /// Index present only in the actual schema, or redefined.
    DropIndex,
    /// Index present only in the declared schema, or redefined.
    AddIndex,
}

/// How column modifications are carried out on dialects that cannot alter
/// a column in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyPolicy {
    /// Drop the column and add it again. Loses the column's data.
    ///
    /// Columns `ALTER TABLE` cannot drop or add back (keys, unique and
    /// referencing columns, NOT NULL without a default) are rebuilt instead.
    #[default]
    DropAndAdd,
    /// Copy the table into a new one with the declared shape, then swap.
    Rebuild,
}

/// One step of a diff report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// What the step does.
    pub operation: DiffOperation,
    /// Table the step applies to.
    pub table: String,
    /// Column name, or index name for index operations.
    pub column: String,
    /// Whether the step can lose data.
    pub destructive: bool,
    /// Complete statements, executed in order. Empty when the change is
    /// carried by another entry's table rebuild.
    pub sql: Vec<String>,
}

/// Something the engine noticed but does not turn into DDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffWarning {
    /// The primary key columns differ; changing them needs a manual migration.
    PrimaryKeyChange {
        /// Actual primary key.
        actual: Vec<String>,
        /// Declared primary key.
        declared: Vec<String>,
    },
    /// A column's auto-increment flag differs.
    AutoIncrementChange {
        /// Column name.
        column: String,
        /// Declared value.
        declared: bool,
    },
}

/// Ordered changes for one table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiffReport {
    /// Table name.
    pub table: String,
    /// Steps in execution order.
    pub entries: Vec<DiffEntry>,
    /// Changes that were detected but not translated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DiffWarning>,
}

impl DiffReport {
    /// Returns `true` if there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any step can lose data.
    #[must_use]
    pub fn has_destructive(&self) -> bool {
        self.entries.iter().any(|e| e.destructive)
    }

    /// All statements in execution order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.entries.iter().flat_map(|e| e.sql.iter().cloned()).collect()
    }

    /// Entries of one kind.
    pub fn entries_of(&self, operation: DiffOperation) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(move |e| e.operation == operation)
    }
}

/// Differences between a registry and a live database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseDiff {
    /// Declared tables missing from the database, with their CREATE
    /// statements, in dependency order.
    pub missing_tables: Vec<(String, Vec<String>)>,
    /// Non-empty reports for tables present on both sides.
    pub reports: Vec<DiffReport>,
    /// Live tables the registry does not declare. Never dropped.
    pub unmanaged_tables: Vec<String>,
}

impl DatabaseDiff {
    /// Returns `true` if the database matches the registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty() && self.reports.iter().all(DiffReport::is_empty)
    }

    /// Whether applying the diff can lose data.
    #[must_use]
    pub fn has_destructive(&self) -> bool {
        self.reports.iter().any(DiffReport::has_destructive)
    }

    /// All statements: creations first, then per-table changes.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.missing_tables
            .iter()
            .flat_map(|(_, sql)| sql.iter().cloned())
            .chain(self.reports.iter().flat_map(DiffReport::statements))
            .collect()
    }
}

/// Compares table schemas for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct SchemaDiffEngine<'a> {
    dialect: &'a dyn Dialect,
    policy: ModifyPolicy,
}

impl<'a> SchemaDiffEngine<'a> {
    /// Creates an engine with the default [`ModifyPolicy`].
    #[must_use]
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            policy: ModifyPolicy::default(),
        }
    }

    /// Sets the modify policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ModifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Diffs one table. `declared` must be expanded; `actual` is taken as-is.
    pub fn diff_table(&self, declared: &TableSchema, actual: &TableSchema) -> Result<DiffReport> {
        declared.validate()?;
        let dialect = self.dialect;
        let table = declared.name.as_str();

        let actual_columns: BTreeMap<&str, &Column> = actual
            .persisted_columns()
            .map(|c| (c.name.as_str(), c))
            .collect();

        let mut adds = Vec::new();
        let mut modified = Vec::new();
        let mut warnings = Vec::new();

        for column in declared.persisted_columns() {
            match actual_columns.get(column.name.as_str()) {
                None => adds.push(DiffEntry {
                    operation: DiffOperation::AddColumn,
                    table: table.to_string(),
                    column: column.name.clone(),
                    destructive: false,
                    sql: vec![dialect.add_column(table, column)?],
                }),
                Some(existing) => {
                    if column.auto_increment != existing.auto_increment {
                        warnings.push(DiffWarning::AutoIncrementChange {
                            column: column.name.clone(),
                            declared: column.auto_increment,
                        });
                    }
                    let change = self.compare(column, existing)?;
                    if change.any() {
                        modified.push((column, change));
                    }
                }
            }
        }

        // Indexes covering a dropped column go away with it, before the
        // column itself: SQLite refuses to drop an indexed column.
        // Modifications run first, so they claim shared indexes first.
        let existing_indexes = actual.index_definitions();
        let mut claimed = BTreeSet::new();
        let modifies =
            self.modify_entries(declared, actual, &modified, &existing_indexes, &mut claimed)?;
        let mut drops = Vec::new();
        for column in actual.persisted_columns() {
            // Names declared virtual are left alone as well.
            if declared.get_column(&column.name).is_some() {
                continue;
            }
            let mut sql = Vec::new();
            for index in &existing_indexes {
                if index.columns.contains(&column.name) && claimed.insert(index.name.clone()) {
                    sql.push(dialect.drop_index(table, &index.name));
                }
            }
            sql.push(dialect.drop_column(table, &column.name));
            drops.push(DiffEntry {
                operation: DiffOperation::DropColumn,
                table: table.to_string(),
                column: column.name.clone(),
                destructive: true,
                sql,
            });
        }


        let actual_pk = actual_primary_key(actual);
        if !actual_pk.is_empty() && actual_pk != declared.primary_key {
            warnings.push(DiffWarning::PrimaryKeyChange {
                actual: actual_pk,
                declared: declared.primary_key.clone(),
            });
        }
        for warning in &warnings {
            warn!(table, ?warning, "Schema change needs a manual migration");
        }

        let mut entries = adds;
        entries.extend(modifies);
        entries.extend(drops);
        entries.extend(self.index_entries(declared, &existing_indexes, &claimed));

        debug!(table, entries = entries.len(), "Diffed table");
        Ok(DiffReport {
            table: table.to_string(),
            entries,
            warnings,
        })
    }

    /// Diffs a whole registry against introspected tables.
    ///
    /// `actual` maps live table names to their introspected schemas. Tables
    /// the registry does not know are reported, never dropped.
    pub fn diff_database(
        &self,
        registry: &SchemaRegistry,
        actual: &BTreeMap<String, TableSchema>,
        options: CompileOptions,
    ) -> Result<DatabaseDiff> {
        let compiler = SchemaCompiler::new(self.dialect).with_options(options);
        let mut diff = DatabaseDiff::default();

        let mut declared = Vec::with_capacity(registry.len());
        for name in registry.dependency_order() {
            declared.push(registry.prepare(name)?);
        }

        for table in &declared {
            match actual.get(&table.name) {
                Some(live) => {
                    let report = self.diff_table(table, live)?;
                    if !report.is_empty() || !report.warnings.is_empty() {
                        diff.reports.push(report);
                    }
                }
                None => diff
                    .missing_tables
                    .push((table.name.clone(), compiler.compile(table)?)),
            }
        }

        diff.unmanaged_tables = actual
            .keys()
            .filter(|name| registry.get_table(name).is_none() && name.as_str() != METADATA_TABLE)
            .cloned()
            .collect();

        Ok(diff)
    }

    /// Material differences between a declared column and its actual state.
    pub fn compare(&self, declared: &Column, actual: &Column) -> Result<ColumnChange> {
        let dialect = self.dialect;
        let declared_type = dialect.canonical_type(&dialect.type_name(declared)?);
        let actual_type = match &actual.native_type {
            Some(native) => dialect.canonical_type(native),
            None => dialect.canonical_type(&dialect.type_name(actual)?),
        };

        let defaults_apply = !declared.auto_increment && !actual.auto_increment;
        let normalize = |column: &Column| {
            column
                .default
                .as_ref()
                .and_then(|d| dialect.normalize_default(&dialect.render_default(d)))
        };

        Ok(ColumnChange {
            type_changed: declared_type != actual_type,
            nullable_changed: declared.effective_nullable() != actual.effective_nullable(),
            default_changed: defaults_apply && normalize(declared) != normalize(actual),
        })
    }

    fn modify_entries(
        &self,
        declared: &TableSchema,
        actual: &TableSchema,
        modified: &[(&Column, ColumnChange)],
        existing_indexes: &[IndexSchema],
        claimed: &mut BTreeSet<String>,
    ) -> Result<Vec<DiffEntry>> {
        let dialect = self.dialect;
        let table = declared.name.as_str();
        let entry = |column: &Column, destructive, sql| DiffEntry {
            operation: DiffOperation::ModifyColumn,
            table: table.to_string(),
            column: column.name.clone(),
            destructive,
            sql,
        };

        if dialect.supports_alter_column() {
            return modified
                .iter()
                .map(|&(column, change)| {
                    Ok(entry(column, false, dialect.modify_column(table, column, change)?))
                })
                .collect();
        }
        if modified.is_empty() {
            return Ok(Vec::new());
        }

        let pinned = modified
            .iter()
            .any(|&(column, _)| pinned_column(declared, actual, column));
        if self.policy == ModifyPolicy::DropAndAdd && !pinned {
            let mut entries = Vec::with_capacity(modified.len());
            for &(column, _) in modified {
                // Declared indexes on the column come back as AddIndex entries.
                let mut sql = Vec::new();
                for index in existing_indexes {
                    if index.columns.contains(&column.name) && claimed.insert(index.name.clone()) {
                        sql.push(dialect.drop_index(table, &index.name));
                    }
                }
                sql.push(dialect.drop_column(table, &column.name));
                sql.push(dialect.add_column(table, column)?);
                entries.push(entry(column, true, sql));
            }
            return Ok(entries);
        }

        let mut rebuild = Some(self.rebuild_statements(declared, actual)?);
        Ok(modified
            .iter()
            .map(|&(column, _)| entry(column, false, rebuild.take().unwrap_or_default()))
            .collect())
    }

    /// Copy-then-swap rebuild of `actual` (after pending column additions)
    /// into the declared column definitions.
    fn rebuild_statements(&self, declared: &TableSchema, actual: &TableSchema) -> Result<Vec<String>> {
        let dialect = self.dialect;
        let table = declared.name.as_str();
        let scratch = format!("__rebuild_{table}");

        let mut shape = TableSchema::new(scratch.clone()).without_auto_id();
        shape.references = declared.references.clone();
        for column in actual.persisted_columns() {
            let definition = declared.get_column(&column.name).unwrap_or(column);
            shape.columns.push(definition.clone());
        }
        for column in declared.persisted_columns() {
            if actual.get_column(&column.name).is_none() {
                shape.columns.push(column.clone());
            }
        }
        let declared_pk_fits = declared
            .primary_key
            .iter()
            .all(|pk| shape.get_column(pk).is_some());
        shape.primary_key = if declared_pk_fits {
            declared.primary_key.clone()
        } else {
            actual_primary_key(actual)
        };

        let copied: Vec<String> = shape
            .columns
            .iter()
            .map(|c| dialect.quote_identifier(&c.name))
            .collect();
        let copied = copied.join(", ");

        let mut statements = vec![
            dialect.create_table(
                &shape,
                CreateOptions {
                    foreign_keys: true,
                    ..CreateOptions::default()
                },
            )?,
            format!(
                "INSERT INTO {} ({copied}) SELECT {copied} FROM {}",
                dialect.quote_identifier(&scratch),
                dialect.quote_identifier(table)
            ),
            dialect.drop_table(table, false),
            dialect.rename_table(&scratch, table),
        ];
        for index in actual.index_definitions() {
            statements.push(dialect.create_index(table, &index, false));
        }
        Ok(statements)
    }

    /// Index changes. Indexes in `claimed` were already dropped together
    /// with their columns.
    fn index_entries(
        &self,
        declared: &TableSchema,
        existing: &[IndexSchema],
        claimed: &BTreeSet<String>,
    ) -> Vec<DiffEntry> {
        let dialect = self.dialect;
        let table = declared.name.as_str();
        let wanted = declared.index_definitions();

        let mut drops = Vec::new();
        let mut adds = Vec::new();

        for index in existing {
            if claimed.contains(&index.name) {
                continue;
            }
            match wanted.iter().find(|w| w.name == index.name) {
                Some(w) if w == index => {}
                _ => drops.push(DiffEntry {
                    operation: DiffOperation::DropIndex,
                    table: table.to_string(),
                    column: index.name.clone(),
                    destructive: true,
                    sql: vec![dialect.drop_index(table, &index.name)],
                }),
            }
        }
        for index in &wanted {
            match existing.iter().find(|e| e.name == index.name) {
                Some(e) if e == index && !claimed.contains(&e.name) => {}
                _ => adds.push(DiffEntry {
                    operation: DiffOperation::AddIndex,
                    table: table.to_string(),
                    column: index.name.clone(),
                    destructive: false,
                    sql: vec![dialect.create_index(table, index, false)],
                }),
            }
        }

        drops.extend(adds);
        drops
    }
}

/// Whether `column` can neither be dropped nor added back by `ALTER TABLE`
/// on a dialect without `ALTER COLUMN`: keys, unique and referencing
/// columns, and NOT NULL columns without a default.
fn pinned_column(declared: &TableSchema, actual: &TableSchema, column: &Column) -> bool {
    let live = actual.get_column(&column.name);
    column.unique
        || column.primary_key
        || (!column.effective_nullable() && column.default.is_none())
        || live.is_some_and(|c| c.unique || c.primary_key)
        || declared.primary_key.contains(&column.name)
        || actual_primary_key(actual).contains(&column.name)
        || declared.references.iter().any(|r| r.column == column.name)
}

/// Primary key of an actual schema, from its list or the column flags.
fn actual_primary_key(actual: &TableSchema) -> Vec<String> {
    if actual.primary_key.is_empty() {
        actual
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    } else {
        actual.primary_key.clone()
    }
}
