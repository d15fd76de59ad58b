//! Arena of declared tables and mixins.
//!
//! References between tables are plain names resolved here, so cycles are
//! expressible without shared ownership.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::schema::{MixinSchema, TableSchema};

/// Name of the table the migration machinery keeps its bookkeeping in.
pub const METADATA_TABLE: &str = "__meta__";

/// Registry of table schemas and mixins.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
    mixins: BTreeMap<String, MixinSchema>,
    external: BTreeSet<String>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table, builder style.
    ///
    /// A table with the same name replaces the previous one; use
    /// [`Self::add_table`] to reject duplicates instead.
    #[must_use]
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Adds a mixin, builder style.
    #[must_use]
    pub fn mixin(mut self, mixin: MixinSchema) -> Self {
        self.mixins.insert(mixin.name.clone(), mixin);
        self
    }

    /// Declares a table that exists but is not managed by this registry.
    /// References to it are accepted; no DDL is ever emitted for it.
    #[must_use]
    pub fn external(mut self, name: impl Into<String>) -> Self {
        self.external.insert(name.into());
        self
    }

    /// Registers a table, failing if the name is taken.
    pub fn add_table(&mut self, table: TableSchema) -> Result<()> {
        if self.tables.contains_key(&table.name) {
            return Err(SchemaError::validation(
                &table.name,
                "table is already registered",
            ));
        }
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    /// Registers a mixin, failing if the name is taken.
    pub fn add_mixin(&mut self, mixin: MixinSchema) -> Result<()> {
        if self.mixins.contains_key(&mixin.name) {
            return Err(SchemaError::validation(
                &mixin.name,
                "mixin is already registered",
            ));
        }
        self.mixins.insert(mixin.name.clone(), mixin);
        Ok(())
    }

    /// Gets a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Iterates over the tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// Iterates over the table names in name order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Whether `name` is a registered or external table.
    #[must_use]
    pub fn knows_table(&self, name: &str) -> bool {
        self.tables.contains_key(name) || self.external.contains(name)
    }

    /// Number of registered tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Expands mixins and locales of `table` in place.
    pub fn expand(&self, table: &mut TableSchema) -> Result<()> {
        table.expand_with(|name| self.mixins.get(name))
    }

    /// Validates an expanded table, including references to other tables.
    pub fn validate(&self, table: &TableSchema) -> Result<()> {
        table.validate()?;
        for reference in &table.references {
            if reference.table != table.name && !self.knows_table(&reference.table) {
                return Err(SchemaError::validation(
                    &table.name,
                    format!(
                        "column '{}' references unknown table '{}'",
                        reference.column, reference.table
                    ),
                ));
            }
            if let Some(target) = self.tables.get(&reference.table) {
                if target.mixins.is_empty()
                    && !target.columns.iter().any(|c| c.name == reference.target_column)
                    && !(reference.target_column == "id" && target.auto_id)
                {
                    return Err(SchemaError::validation(
                        &table.name,
                        format!(
                            "column '{}' references unknown column '{}.{}'",
                            reference.column, reference.table, reference.target_column
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns an expanded, validated copy of the named table.
    pub fn prepare(&self, name: &str) -> Result<TableSchema> {
        let mut table = self
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::validation(name, "table is not registered"))?;
        self.expand(&mut table)?;
        self.validate(&table)?;
        debug!(table = %table.name, columns = table.columns.len(), "Prepared table schema");
        Ok(table)
    }

    /// Table names ordered so that referenced tables come before the tables
    /// referencing them. Ties and cycles are broken by name.
    #[must_use]
    pub fn dependency_order(&self) -> Vec<&str> {
        fn visit<'a>(
            registry: &'a SchemaRegistry,
            name: &'a str,
            visiting: &mut BTreeSet<&'a str>,
            done: &mut BTreeSet<&'a str>,
            order: &mut Vec<&'a str>,
        ) {
            if done.contains(name) || !visiting.insert(name) {
                return;
            }
            if let Some(table) = registry.tables.get(name) {
                let mut targets: Vec<&str> = table
                    .references
                    .iter()
                    .map(|r| r.table.as_str())
                    .filter(|t| *t != name)
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                for target in targets {
                    if let Some((key, _)) = registry.tables.get_key_value(target) {
                        visit(registry, key.as_str(), visiting, done, order);
                    }
                }
            }
            visiting.remove(name);
            done.insert(name);
            order.push(name);
        }

        let mut visiting = BTreeSet::new();
        let mut done = BTreeSet::new();
        let mut order = Vec::with_capacity(self.tables.len());
        for name in self.tables.keys() {
            visit(self, name.as_str(), &mut visiting, &mut done, &mut order);
        }
        order
    }
}

/// A registry as written in a schema file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    /// Declared tables.
    #[serde(default)]
    pub tables: Vec<TableSchema>,
    /// Declared mixins.
    #[serde(default)]
    pub mixins: Vec<MixinSchema>,
    /// Tables that exist but are managed elsewhere.
    #[serde(default)]
    pub external: Vec<String>,
}

impl RegistryFile {
    /// Builds the registry, rejecting duplicate table or mixin names.
    pub fn into_registry(self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        for mixin in self.mixins {
            registry.add_mixin(mixin)?;
        }
        for table in self.tables {
            registry.add_table(table)?;
        }
        registry.external.extend(self.external);
        Ok(registry)
    }
}
