//! Schema representation types.
//!
//! These types describe the structure of database tables as declared by the
//! application, and are also what the introspector reconstructs from a live
//! database so both sides can be compared.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaError};

/// Semantic column type tag.
///
/// Tags are dialect-neutral; each [`Dialect`](crate::dialect::Dialect)
/// decides which native type a tag becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    BigInt,
    /// 16-bit integer.
    SmallInt,
    /// Variable-length string, bounded by `length` when set.
    Str,
    /// Unbounded text.
    Text,
    /// Single precision floating point.
    Float,
    /// Double precision floating point.
    Double,
    /// Fixed point number; `length` is the precision.
    Decimal,
    /// Boolean.
    Bool,
    /// Date only.
    Date,
    /// Time only.
    Time,
    /// Date and time.
    DateTime,
    /// Binary data, bounded by `length` when set.
    Binary,
    /// JSON document.
    Json,
    /// UUID.
    Uuid,
    /// One of a fixed set of string values.
    Enum,
}

impl ColumnType {
    /// Returns the tag as written in schema files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::SmallInt => "smallint",
            Self::Str => "str",
            Self::Text => "text",
            Self::Float => "float",
            Self::Double => "double",
            Self::Decimal => "decimal",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime => "datetime",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Uuid => "uuid",
            Self::Enum => "enum",
        }
    }

    /// Returns true for the integer tags.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::BigInt | Self::SmallInt)
    }
}

/// Default value for a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultValue {
    /// NULL default.
    Null,
    /// Boolean default.
    Bool(bool),
    /// Integer default.
    Integer(i64),
    /// Float default.
    Float(f64),
    /// String literal default.
    String(String),
    /// Deferred SQL expression (e.g. `CURRENT_TIMESTAMP`).
    Expression(String),
}

impl DefaultValue {
    /// Returns the generic SQL representation of this default value.
    ///
    /// Dialects may render booleans differently.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => quote_literal(s),
            Self::Expression(expr) => expr.clone(),
        }
    }
}

/// Quotes a string as a SQL literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Foreign key action (ON DELETE, ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted/updated).
    #[default]
    NoAction,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Cascade the delete/update to referencing rows.
    Cascade,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

const fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Schema definition for a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Semantic type tag.
    pub isa: ColumnType,
    /// Length for strings and binaries, precision for decimals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// Scale for decimals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Whether the column allows NULL values.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    /// Whether this column is part of the primary key.
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    /// Whether this column auto-increments.
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_increment: bool,
    /// Whether this column has a UNIQUE constraint.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Unsigned integer.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsigned: bool,
    /// Whether a single-column index should be created.
    #[serde(default, skip_serializing_if = "is_false")]
    pub index: bool,
    /// Locales to generate parallel `<name>_<locale>` columns for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locales: Vec<String>,
    /// Computed column; never persisted.
    #[serde(rename = "virtual", default, skip_serializing_if = "is_false")]
    pub is_virtual: bool,
    /// Allowed values for `enum` columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    /// Column comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Native type as reported by the database (introspected columns only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
}

impl Column {
    /// Creates a new nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, isa: ColumnType) -> Self {
        Self {
            name: name.into(),
            isa,
            length: None,
            scale: None,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
            unique: false,
            unsigned: false,
            index: false,
            locales: Vec::new(),
            is_virtual: false,
            enum_values: Vec::new(),
            comment: None,
            native_type: None,
        }
    }

    /// Sets the length (or decimal precision).
    #[must_use]
    pub const fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Sets decimal precision and scale.
    #[must_use]
    pub const fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.length = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Sets the column as NOT NULL.
    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the column as nullable.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Sets the column as the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Sets the column to auto-increment.
    #[must_use]
    pub const fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Sets the column as unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the column as an unsigned integer.
    #[must_use]
    pub const fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    /// Requests a single-column index.
    #[must_use]
    pub const fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    /// Adds locale variants.
    #[must_use]
    pub fn locales<I, S>(mut self, locales: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locales.extend(locales.into_iter().map(Into::into));
        self
    }

    /// Marks the column as virtual (computed, never persisted).
    #[must_use]
    pub const fn as_virtual(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    /// Sets the allowed values of an `enum` column.
    #[must_use]
    pub fn values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the column comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Nullability as the database enforces it: primary keys never accept NULL.
    #[must_use]
    pub const fn effective_nullable(&self) -> bool {
        self.nullable && !self.primary_key
    }
}

/// Schema definition for an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Index name.
    pub name: String,
    /// Columns included in the index.
    pub columns: Vec<String>,
    /// Whether this is a unique index.
    #[serde(default)]
    pub unique: bool,
}

impl IndexSchema {
    /// Creates a non-unique index.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Makes the index unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

fn default_target_column() -> String {
    "id".to_string()
}

/// A reference from a column to a column of another table.
///
/// The target is a table name resolved against a
/// [`SchemaRegistry`](crate::registry::SchemaRegistry), never a pointer,
/// so mutually referencing tables can be declared in any order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Referencing column in this table.
    pub column: String,
    /// Referenced table name.
    pub table: String,
    /// Referenced column.
    #[serde(default = "default_target_column")]
    pub target_column: String,
    /// Action on delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ForeignKeyAction>,
    /// Action on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ForeignKeyAction>,
}

impl Reference {
    /// Creates a reference to `table.id`.
    #[must_use]
    pub fn new(column: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            table: table.into(),
            target_column: default_target_column(),
            on_delete: None,
            on_update: None,
        }
    }

    /// Sets the referenced column.
    #[must_use]
    pub fn target_column(mut self, column: impl Into<String>) -> Self {
        self.target_column = column.into();
        self
    }

    /// Sets the ON DELETE action.
    #[must_use]
    pub const fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    /// Sets the ON UPDATE action.
    #[must_use]
    pub const fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = Some(action);
        self
    }

    /// Constraint name used when the reference is emitted as a foreign key.
    #[must_use]
    pub fn constraint_name(&self, table: &str) -> String {
        format!("fk_{}_{}", table, self.column)
    }
}

fn default_source_id() -> String {
    "default".to_string()
}

/// Data-source routing for a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    /// Data source id used for reads.
    #[serde(default = "default_source_id")]
    pub read: String,
    /// Data source id used for writes and DDL.
    #[serde(default = "default_source_id")]
    pub write: String,
    /// Column whose value selects a shard, if the table is sharded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            read: default_source_id(),
            write: default_source_id(),
            shard_key: None,
        }
    }
}

/// A reusable schema fragment merged into tables at expansion time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MixinSchema {
    /// Mixin name, referenced from [`TableSchema::mixins`].
    pub name: String,
    /// Columns contributed by the mixin.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Indexes contributed by the mixin.
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl MixinSchema {
    /// Creates an empty mixin.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Complete schema definition for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Short alias used in generated queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Column definitions, in physical order.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Primary key column(s).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    /// References to other tables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    /// Index definitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSchema>,
    /// Mixins applied in order at expansion time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixins: Vec<String>,
    /// Synthesize an integer `id` primary key when none is declared.
    #[serde(default = "default_true")]
    pub auto_id: bool,
    /// Table comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Data-source routing.
    #[serde(default)]
    pub route: Route,
    #[serde(skip)]
    expanded: bool,
}

impl TableSchema {
    /// Creates a new table schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            columns: Vec::new(),
            primary_key: Vec::new(),
            references: Vec::new(),
            indexes: Vec::new(),
            mixins: Vec::new(),
            auto_id: true,
            comment: None,
            route: Route::default(),
            expanded: false,
        }
    }

    /// Adds a column to the table.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        if column.primary_key && !self.primary_key.contains(&column.name) {
            self.primary_key.push(column.name.clone());
        }
        self.columns.push(column);
        self
    }

    /// Sets the primary key columns.
    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the alias.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Adds a reference.
    #[must_use]
    pub fn reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Appends a mixin.
    #[must_use]
    pub fn mixin(mut self, name: impl Into<String>) -> Self {
        self.mixins.push(name.into());
        self
    }

    /// Disables the synthetic `id` primary key.
    #[must_use]
    pub const fn without_auto_id(mut self) -> Self {
        self.auto_id = false;
        self
    }

    /// Sets the table comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Sets the data-source routing.
    #[must_use]
    pub fn route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Gets a mutable column by name.
    #[must_use]
    pub fn get_column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Columns that are physically stored, in declaration order.
    pub fn persisted_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_virtual)
    }

    /// Whether mixin and locale expansion already ran.
    #[must_use]
    pub const fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Marks a schema as already flat, such as one reconstructed from a live
    /// database. Introspected schemas have no mixins or locales to expand.
    #[must_use]
    pub fn flattened(mut self) -> Self {
        self.expanded = true;
        self
    }

    /// All indexes the table should have: one per indexed column (in column
    /// order) followed by the declared indexes.
    #[must_use]
    pub fn index_definitions(&self) -> Vec<IndexSchema> {
        let mut indexes: Vec<IndexSchema> = self
            .persisted_columns()
            .filter(|c| c.index)
            .map(|c| IndexSchema::new(format!("idx_{}_{}", self.name, c.name), [c.name.clone()]))
            .filter(|hint| !self.indexes.iter().any(|i| i.name == hint.name))
            .collect();
        indexes.extend(self.indexes.iter().cloned());
        indexes
    }

    /// Expands the schema using `resolve` to look up mixins by name.
    ///
    /// Runs once; later calls return immediately. The pass is also
    /// idempotent on its own: replaying it over an already flattened column
    /// list yields the same columns.
    pub fn expand_with<'m, F>(&mut self, resolve: F) -> Result<()>
    where
        F: Fn(&str) -> Option<&'m MixinSchema>,
    {
        if self.expanded {
            return Ok(());
        }

        for mixin_name in &self.mixins {
            let mixin = resolve(mixin_name).ok_or_else(|| {
                SchemaError::validation(&self.name, format!("unknown mixin '{mixin_name}'"))
            })?;
            for column in &mixin.columns {
                upsert_column(&mut self.columns, column.clone());
            }
            for index in &mixin.indexes {
                match self.indexes.iter_mut().find(|i| i.name == index.name) {
                    Some(existing) => *existing = index.clone(),
                    None => self.indexes.push(index.clone()),
                }
            }
        }

        expand_locales(&mut self.columns);

        for column in &self.columns {
            if column.primary_key && !self.primary_key.contains(&column.name) {
                self.primary_key.push(column.name.clone());
            }
        }

        if self.primary_key.is_empty() && self.auto_id && self.get_column("id").is_none() {
            self.columns.insert(
                0,
                Column::new("id", ColumnType::Int)
                    .primary_key()
                    .auto_increment(),
            );
            self.primary_key.push("id".to_string());
        }

        self.expanded = true;
        Ok(())
    }

    /// Checks the invariants that only depend on the table itself.
    ///
    /// The schema must be expanded first.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(SchemaError::validation(&self.name, message));

        if !self.expanded {
            return fail("mixins have not been expanded".to_string());
        }
        if self.name.trim().is_empty() {
            return fail("table name is empty".to_string());
        }

        let mut seen = std::collections::BTreeSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return fail("column with an empty name".to_string());
            }
            if !seen.insert(column.name.as_str()) {
                return fail(format!("duplicate column '{}'", column.name));
            }
            if column.is_virtual
                && (column.primary_key || column.index || column.unique || column.auto_increment)
            {
                return fail(format!(
                    "virtual column '{}' cannot be a key or be indexed",
                    column.name
                ));
            }
            if column.isa == ColumnType::Enum && column.enum_values.is_empty() {
                return fail(format!("enum column '{}' has no values", column.name));
            }
            if let (Some(precision), Some(scale)) = (column.length, column.scale) {
                if scale > precision {
                    return fail(format!(
                        "column '{}' has scale {scale} greater than precision {precision}",
                        column.name
                    ));
                }
            }
            if column.auto_increment && !(column.primary_key && column.isa.is_integer()) {
                return fail(format!(
                    "auto-increment column '{}' must be an integer primary key",
                    column.name
                ));
            }
        }

        if self.persisted_columns().next().is_none() {
            return fail("table has no persisted columns".to_string());
        }

        if self.primary_key.is_empty() {
            return fail("no primary key is declared and auto_id is disabled".to_string());
        }
        for pk in &self.primary_key {
            match self.get_column(pk) {
                Some(column) if column.is_virtual => {
                    return fail(format!("primary key column '{pk}' is virtual"));
                }
                Some(_) => {}
                None => return fail(format!("primary key column '{pk}' does not exist")),
            }
        }
        if self.primary_key.len() > 1 && self.columns.iter().any(|c| c.auto_increment) {
            return fail("auto-increment is not allowed with a composite primary key".to_string());
        }

        let mut index_names = std::collections::BTreeSet::new();
        for index in self.index_definitions() {
            if !index_names.insert(index.name.clone()) {
                return fail(format!("duplicate index '{}'", index.name));
            }
            if index.columns.is_empty() {
                return fail(format!("index '{}' has no columns", index.name));
            }
            for name in &index.columns {
                match self.get_column(name) {
                    Some(column) if !column.is_virtual => {}
                    _ => {
                        return fail(format!(
                            "index '{}' covers unknown or virtual column '{name}'",
                            index.name
                        ));
                    }
                }
            }
        }

        for reference in &self.references {
            match self.get_column(&reference.column) {
                Some(column) if !column.is_virtual => {}
                _ => {
                    return fail(format!(
                        "reference from unknown or virtual column '{}'",
                        reference.column
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Replaces a same-named column in place, or appends it.
fn upsert_column(columns: &mut Vec<Column>, column: Column) {
    match columns.iter_mut().find(|c| c.name == column.name) {
        Some(existing) => *existing = column,
        None => columns.push(column),
    }
}

/// Appends a `<name>_<locale>` clone for every locale of every column.
fn expand_locales(columns: &mut Vec<Column>) {
    let localized: Vec<Column> = columns
        .iter()
        .filter(|c| !c.locales.is_empty())
        .flat_map(|c| {
            c.locales.iter().map(move |locale| {
                let mut clone = c.clone();
                clone.name = format!("{}_{}", c.name, locale);
                clone.locales.clear();
                clone.primary_key = false;
                clone.auto_increment = false;
                clone
            })
        })
        .collect();

    for column in localized {
        upsert_column(columns, column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamps() -> MixinSchema {
        MixinSchema::new("timestamps")
            .column(Column::new("created_at", ColumnType::DateTime).not_null())
            .column(Column::new("updated_at", ColumnType::DateTime))
    }

    #[test]
    fn test_column_builder() {
        let col = Column::new("id", ColumnType::BigInt)
            .primary_key()
            .auto_increment();

        assert_eq!(col.name, "id");
        assert!(col.primary_key);
        assert!(col.auto_increment);
        assert!(!col.nullable);
        assert!(!col.effective_nullable());
    }

    #[test]
    fn test_table_builder_tracks_primary_key() {
        let table = TableSchema::new("users")
            .column(Column::new("id", ColumnType::BigInt).primary_key())
            .column(Column::new("name", ColumnType::Str).length(255).not_null());

        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.primary_key, vec!["id"]);
    }

    #[test]
    fn test_default_value_to_sql() {
        assert_eq!(DefaultValue::Null.to_sql(), "NULL");
        assert_eq!(DefaultValue::Bool(true).to_sql(), "1");
        assert_eq!(DefaultValue::Integer(42).to_sql(), "42");
        assert_eq!(DefaultValue::String("it's".into()).to_sql(), "'it''s'");
        assert_eq!(
            DefaultValue::Expression("CURRENT_TIMESTAMP".into()).to_sql(),
            "CURRENT_TIMESTAMP"
        );
    }

    #[test]
    fn test_auto_id_is_synthesized() {
        let mut table = TableSchema::new("tags").column(Column::new("label", ColumnType::Str));
        table.expand_with(|_| None).unwrap();

        assert_eq!(table.columns[0].name, "id");
        assert!(table.columns[0].auto_increment);
        assert_eq!(table.primary_key, vec!["id"]);
        table.validate().unwrap();
    }

    #[test]
    fn test_missing_primary_key_without_auto_id() {
        let mut table = TableSchema::new("tags")
            .column(Column::new("label", ColumnType::Str))
            .without_auto_id();
        table.expand_with(|_| None).unwrap();

        let err = table.validate().unwrap_err();
        assert!(matches!(err, SchemaError::SchemaValidation { .. }));
    }

    #[test]
    fn test_mixin_columns_appended_and_last_writer_wins() {
        let mixin = timestamps();
        let audit = MixinSchema::new("audit")
            .column(Column::new("updated_at", ColumnType::DateTime).not_null())
            .column(Column::new("updated_by", ColumnType::Int));
        let mut table = TableSchema::new("posts")
            .column(Column::new("title", ColumnType::Str))
            .mixin("timestamps")
            .mixin("audit");

        table
            .expand_with(|name| match name {
                "timestamps" => Some(&mixin),
                "audit" => Some(&audit),
                _ => None,
            })
            .unwrap();

        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["id", "title", "created_at", "updated_at", "updated_by"]
        );
        assert!(!table.get_column("updated_at").unwrap().nullable);
    }

    #[test]
    fn test_unknown_mixin_fails() {
        let mut table = TableSchema::new("posts").mixin("missing");
        let err = table.expand_with(|_| None).unwrap_err();
        assert!(err.to_string().contains("unknown mixin 'missing'"));
    }

    #[test]
    fn test_locale_expansion() {
        let mut table = TableSchema::new("products")
            .column(Column::new("title", ColumnType::Str).length(128).locales(["en", "fr"]));
        table.expand_with(|_| None).unwrap();

        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "title", "title_en", "title_fr"]);
        assert!(table.get_column("title_fr").unwrap().locales.is_empty());
        assert_eq!(table.get_column("title_fr").unwrap().length, Some(128));
    }

    #[test]
    fn test_replaying_expansion_does_not_duplicate() {
        let mixin = timestamps();
        let mut once = TableSchema::new("posts")
            .column(Column::new("title", ColumnType::Str).locales(["en"]))
            .mixin("timestamps");
        once.expand_with(|_| Some(&mixin)).unwrap();
        let columns = once.columns.clone();

        once.expand_with(|_| Some(&mixin)).unwrap();
        assert_eq!(once.columns, columns);

        // Replaying the pass itself on the flattened list is also stable.
        once.expanded = false;
        once.expand_with(|_| Some(&mixin)).unwrap();
        assert_eq!(once.columns, columns);
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let table = TableSchema::new("t")
            .column(Column::new("id", ColumnType::Int).primary_key())
            .column(Column::new("a", ColumnType::Int))
            .column(Column::new("a", ColumnType::Str))
            .flattened();
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate column 'a'"));
    }

    #[test]
    fn test_validate_rejects_virtual_key() {
        let table = TableSchema::new("t")
            .column(Column::new("id", ColumnType::Int).primary_key())
            .column(Column::new("total", ColumnType::Int).as_virtual().indexed())
            .flattened();
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_requires_expansion() {
        let table = TableSchema::new("t").column(Column::new("id", ColumnType::Int).primary_key());
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_index_definitions_include_hints() {
        let table = TableSchema::new("users")
            .column(Column::new("email", ColumnType::Str).indexed())
            .index(IndexSchema::new("idx_users_name", ["first", "last"]).unique());

        let names: Vec<String> = table.index_definitions().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["idx_users_email", "idx_users_name"]);
    }

    #[test]
    fn test_deserialize_table() {
        let json = r#"{
            "name": "books",
            "columns": [
                {"name": "title", "isa": "str", "length": 200, "nullable": false},
                {"name": "price", "isa": "decimal", "length": 10, "scale": 2,
                 "default": {"integer": 0}},
                {"name": "summary", "isa": "text", "virtual": true}
            ],
            "references": [{"column": "author_id", "table": "authors"}],
            "route": {"read": "replica"}
        }"#;
        let table: TableSchema = serde_json::from_str(json).unwrap();

        assert_eq!(table.columns.len(), 3);
        assert!(!table.columns[0].nullable);
        assert!(table.columns[2].is_virtual);
        assert_eq!(table.columns[1].default, Some(DefaultValue::Integer(0)));
        assert_eq!(table.references[0].target_column, "id");
        assert_eq!(table.route.read, "replica");
        assert_eq!(table.route.write, "default");
        assert!(table.auto_id);
        assert!(!table.is_expanded());
    }
}
