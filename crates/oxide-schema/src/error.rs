//! Error types for schema modelling and DDL generation.

/// Errors raised before any SQL reaches a database.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The declared model violates an invariant (duplicate column, missing
    /// primary key, dangling reference, ...).
    #[error("Schema validation failed for table '{table}': {message}")]
    SchemaValidation {
        /// Table (or mixin) the violation was found in.
        table: String,
        /// Description of the violation.
        message: String,
    },

    /// The dialect has no mapping for a type or feature the schema needs.
    #[error("Dialect '{dialect}' does not support {feature}")]
    UnsupportedDialect {
        /// Dialect or driver name.
        dialect: String,
        /// The missing type mapping or feature.
        feature: String,
    },

    /// A data source description is malformed.
    #[error("Invalid data source configuration '{id}': {message}")]
    ConfigValidation {
        /// Data source id.
        id: String,
        /// Description of the problem.
        message: String,
    },
}

impl SchemaError {
    /// Creates a `SchemaValidation` error.
    pub fn validation(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates an `UnsupportedDialect` error.
    pub fn unsupported(dialect: impl Into<String>, feature: impl Into<String>) -> Self {
        Self::UnsupportedDialect {
            dialect: dialect.into(),
            feature: feature.into(),
        }
    }

    /// Creates a `ConfigValidation` error.
    pub fn config(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Result type for schema operations.
pub type Result<T> = std::result::Result<T, SchemaError>;
