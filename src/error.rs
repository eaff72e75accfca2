//! Error types for the persistence layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error
//! handling. Connection-class errors carry an actionable suggestion so callers
//! can report something more useful than the raw driver message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection access failed: {message}")]
    ConnectionAccess { message: String, suggestion: String },

    #[error("No such data source: '{name}'")]
    NoSuchDataSource { name: String },

    #[error("Connection pool for '{name}' exhausted after waiting {waited_ms}ms")]
    PoolExhausted { name: String, waited_ms: u64 },

    #[error("{entity} with id {id} not found in partition {partition}")]
    DataNotFound {
        entity: String,
        id: i64,
        partition: i64,
    },

    #[error("Create failed for table '{table}': {message}")]
    DataCreate { table: String, message: String },

    #[error("Save failed for table '{table}': {message}")]
    DataSave { table: String, message: String },

    #[error("Delete failed for table '{table}': {message}")]
    DataDelete { table: String, message: String },

    #[error(
        "Concurrent modification of {entity} id {id}: stored stamp {stored} no longer matches expected {expected}"
    )]
    ConcurrentModify {
        entity: String,
        id: i64,
        expected: i64,
        stored: i64,
    },

    #[error("Inconsistent data in table '{table}': {message}")]
    InconsistentData { table: String, message: String },

    #[error("Cannot resolve implementation for '{capability}': {detail}")]
    DynamicResolution { capability: String, detail: String },
}

impl StoreError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection access error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionAccess {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an unknown-data-source error.
    pub fn no_such_data_source(name: impl Into<String>) -> Self {
        Self::NoSuchDataSource { name: name.into() }
    }

    /// Create a pool exhaustion error.
    pub fn pool_exhausted(name: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            name: name.into(),
            waited_ms,
        }
    }

    /// Create a not-found error scoped to a partition.
    pub fn not_found(entity: impl Into<String>, id: i64, partition: i64) -> Self {
        Self::DataNotFound {
            entity: entity.into(),
            id,
            partition,
        }
    }

    /// Create a create-failure error.
    pub fn create(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataCreate {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a save-failure error.
    pub fn save(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataSave {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a delete-failure error.
    pub fn delete(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataDelete {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an optimistic-lock conflict error.
    pub fn concurrent_modify(
        entity: impl Into<String>,
        id: i64,
        expected: i64,
        stored: i64,
    ) -> Self {
        Self::ConcurrentModify {
            entity: entity.into(),
            id,
            expected,
            stored,
        }
    }

    /// Create an integrity-violation error. Never retried by callers.
    pub fn inconsistent(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InconsistentData {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a resolution error for the manager cache.
    pub fn resolution(capability: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::DynamicResolution {
            capability: capability.into(),
            detail: detail.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionAccess { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Integrity violations and optimistic-lock conflicts are explicitly not
    /// retryable at this level: a conflict needs a fresh read first, and an
    /// inconsistency needs an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionAccess { .. } | Self::PoolExhausted { .. }
        )
    }
}

/// Convert sqlx errors to StoreError.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => StoreError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .code()
                    .map(|c| format!(" (SQLSTATE: {})", c))
                    .unwrap_or_default();
                StoreError::connection(
                    format!("{}{}", db_err.message(), code),
                    "Check the SQL statement and referenced objects",
                )
            }
            sqlx::Error::PoolTimedOut => StoreError::connection(
                "Connection pool acquire timed out",
                "Increase pool.maxsize or pool.waitperiod, or reduce concurrent load",
            ),
            sqlx::Error::PoolClosed => StoreError::connection(
                "Connection pool is closed",
                "The data source was shut down; re-register it",
            ),
            sqlx::Error::Io(io_err) => StoreError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => StoreError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => StoreError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::RowNotFound => StoreError::connection(
                "No rows returned where one was required",
                "Verify the statement conditions match existing data",
            ),
            sqlx::Error::ColumnNotFound(col) => StoreError::configuration(format!(
                "Column '{}' not found; table shape does not match the mapping",
                col
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                StoreError::configuration(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                StoreError::configuration(format!("Decode error: {}", source))
            }
            _ => StoreError::connection(
                format!("Driver error: {}", err),
                "Check database driver configuration",
            ),
        }
    }
}

/// Result type alias for persistence operations.
pub type StoreResult<T> = Result<T, StoreError>;
