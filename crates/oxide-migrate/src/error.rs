//! Error types for connections, introspection and migrations.

use std::path::PathBuf;

use oxide_schema::SchemaError;

/// Errors that can occur while talking to a database.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The declared schema or a data source description is invalid.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// No data source is registered under this id.
    #[error("Unknown data source '{0}'")]
    UnknownDataSource(String),

    /// A data source is already registered under this id.
    #[error("Data source '{0}' is already registered")]
    DuplicateDataSource(String),

    /// Opening a connection failed.
    #[error("Failed to connect to data source '{id}': {source}")]
    Connection {
        /// Data source id.
        id: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A catalog query was rejected.
    #[error("Failed to introspect '{target}': {source}")]
    Introspection {
        /// Table name, or `tables` for the table listing.
        target: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A table exists but the catalog reported no columns for it.
    #[error("Table '{0}' exists but no columns could be read from the catalog")]
    IncompleteIntrospection(String),

    /// A statement failed.
    #[error("Failed to execute `{sql}`: {source}")]
    Execution {
        /// The offending statement.
        sql: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A migration script's DDL failed. The script is not retried.
    #[error("Migration '{id}' failed on `{sql}`: {source}")]
    MigrationFailed {
        /// Script id.
        id: String,
        /// The offending statement.
        sql: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A migration script's DDL ran but recording it failed.
    #[error("Migration '{id}' ran but could not be recorded: {source}")]
    MigrationUnrecorded {
        /// Script id.
        id: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// Earlier failures must be reconciled before upgrading again.
    #[error("Migrations are blocked by unresolved failures: {}", .0.join(", "))]
    MigrationBlocked(Vec<String>),

    /// A generated migration would lose data and was not allowed to.
    #[error("Generated migration is destructive: {}", .0.join(", "))]
    DestructiveChange(Vec<String>),

    /// No script with this id is known.
    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    /// A migration script file is malformed.
    #[error("Invalid migration script '{path}': {message}")]
    InvalidScript {
        /// Path to the script.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Database error outside of a specific statement.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome classes surfaced to callers such as the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Everything went through.
    Success,
    /// A statement or catalog query failed; nothing was left half done.
    ExecutionFailure,
    /// Input was rejected before any I/O.
    ValidationFailure,
    /// The database could not be reached.
    ConnectionFailure,
    /// The database was left in a state that needs operator reconciliation.
    PartiallyApplied,
}

impl ExitStatus {
    /// Process exit code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ExecutionFailure => 1,
            Self::ValidationFailure => 2,
            Self::ConnectionFailure => 3,
            Self::PartiallyApplied => 4,
        }
    }
}

impl MigrateError {
    /// Classifies the error for callers that only need the outcome.
    #[must_use]
    pub const fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Schema(_)
            | Self::UnknownDataSource(_)
            | Self::DuplicateDataSource(_)
            | Self::DestructiveChange(_)
            | Self::MigrationNotFound(_)
            | Self::InvalidScript { .. }
            | Self::Serialization(_) => ExitStatus::ValidationFailure,
            Self::Connection { .. } => ExitStatus::ConnectionFailure,
            Self::MigrationUnrecorded { .. } | Self::MigrationBlocked(_) => {
                ExitStatus::PartiallyApplied
            }
            Self::Introspection { .. }
            | Self::IncompleteIntrospection(_)
            | Self::Execution { .. }
            | Self::MigrationFailed { .. }
            | Self::Database(_)
            | Self::Io(_) => ExitStatus::ExecutionFailure,
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_statuses_are_distinct() {
        let statuses = [
            ExitStatus::Success,
            ExitStatus::ExecutionFailure,
            ExitStatus::ValidationFailure,
            ExitStatus::ConnectionFailure,
            ExitStatus::PartiallyApplied,
        ];
        let mut codes: Vec<u8> = statuses.iter().map(|s| s.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), statuses.len());
    }

    #[test]
    fn test_classification() {
        let validation = MigrateError::from(SchemaError::validation("t", "no primary key"));
        assert_eq!(validation.exit_status(), ExitStatus::ValidationFailure);

        let unrecorded = MigrateError::MigrationUnrecorded {
            id: "20240101_a".into(),
            source: sqlx::Error::PoolClosed,
        };
        assert_eq!(unrecorded.exit_status(), ExitStatus::PartiallyApplied);

        let connection = MigrateError::Connection {
            id: "default".into(),
            source: sqlx::Error::PoolTimedOut,
        };
        assert_eq!(connection.exit_status(), ExitStatus::ConnectionFailure);
    }

    #[test]
    fn test_execution_error_keeps_sql() {
        let err = MigrateError::Execution {
            sql: "DROP TABLE \"x\"".into(),
            source: sqlx::Error::RowNotFound,
        };
        assert!(err.to_string().contains("DROP TABLE \"x\""));
    }
}
