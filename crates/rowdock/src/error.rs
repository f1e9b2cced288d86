//! Error types for rowdock
//!
//! Two layers of classification:
//! - [`ErrorKind`]: what went wrong from the load's point of view
//!   (connection, schema, write, commit, cleanup)
//! - [`ErrorClass`]: whether the dialect considers a driver failure transient
//!
//! Driver error codes travel as opaque [`DriverCode`] values; only a
//! dialect adapter interprets them.

use std::fmt;
use thiserror::Error;

use crate::types::TableId;

/// Result type for rowdock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Opaque driver-level error code, interpreted only by a dialect adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DriverCode {
    /// Vendor error number (MySQL `1213`, Oracle `ORA-00060` as `60`, SQLite extended code)
    pub vendor_code: Option<i64>,
    /// Five-character SQLSTATE, when the driver reports one
    pub sql_state: Option<String>,
}

impl DriverCode {
    /// Code with only a vendor number
    pub fn vendor(code: i64) -> Self {
        Self {
            vendor_code: Some(code),
            sql_state: None,
        }
    }

    /// Attach a SQLSTATE
    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }
}

impl fmt::Display for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.vendor_code, &self.sql_state) {
            (Some(code), Some(state)) => write!(f, "{} ({})", code, state),
            (Some(code), None) => write!(f, "{}", code),
            (None, Some(state)) => write!(f, "({})", state),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Retry decision for a driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient condition (deadlock, lock wait timeout, busy)
    Retryable,
    /// Anything else
    Fatal,
}

impl ErrorClass {
    /// Whether the failed operation may be attempted again
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// Error kinds surfaced to the caller of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection could not be established or was lost
    ConnectionFailure,
    /// Row arity/type mismatch against the target columns
    SchemaMismatch,
    /// Missing table during introspection
    NotFound,
    /// Retryable write failure that exhausted the retry policy
    RetryableWrite,
    /// Write failure classified fatal
    FatalWrite,
    /// Merge/swap transaction failed and was rolled back
    CommitFailure,
    /// Best-effort intermediate table drop failed
    CleanupFailure,
    /// Statement failed outside the write and commit phases (DDL, catalog queries)
    Query,
    /// Invalid configuration
    Configuration,
    /// Misuse or internal error
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailure => write!(f, "connection_failure"),
            Self::SchemaMismatch => write!(f, "schema_mismatch"),
            Self::NotFound => write!(f, "not_found"),
            Self::RetryableWrite => write!(f, "retryable_write"),
            Self::FatalWrite => write!(f, "fatal_write"),
            Self::CommitFailure => write!(f, "commit_failure"),
            Self::CleanupFailure => write!(f, "cleanup_failure"),
            Self::Query => write!(f, "query"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Main error type for rowdock
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection establishment failed or the connection was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed at the driver
    #[error("query error: {message}")]
    Query {
        message: String,
        code: Option<DriverCode>,
    },

    /// Transaction control (begin/commit/rollback) failed at the driver
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        code: Option<DriverCode>,
    },

    /// Row or schema does not match the target columns
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// Table not found
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Retryable write failure after the retry policy was exhausted
    #[error("write failed after {attempts} attempts: {message}")]
    RetryableWrite {
        attempts: u32,
        message: String,
        code: Option<DriverCode>,
    },

    /// Write failure classified fatal
    #[error("fatal write error: {message}")]
    FatalWrite {
        message: String,
        code: Option<DriverCode>,
    },

    /// Commit (merge or swap) failed
    #[error("commit failed: {message}")]
    Commit {
        message: String,
        code: Option<DriverCode>,
        rolled_back: bool,
    },

    /// Intermediate table cleanup failed
    #[error("cleanup of {table} failed: {message}")]
    Cleanup { table: String, message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Operation not permitted in the current state
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::ConnectionFailure,
            Self::Query { .. } | Self::Transaction { .. } => ErrorKind::Query,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::TableNotFound { .. } => ErrorKind::NotFound,
            Self::RetryableWrite { .. } => ErrorKind::RetryableWrite,
            Self::FatalWrite { .. } => ErrorKind::FatalWrite,
            Self::Commit { .. } => ErrorKind::CommitFailure,
            Self::Cleanup { .. } => ErrorKind::CleanupFailure,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::InvalidState { .. } | Self::Unsupported { .. } | Self::Internal { .. } => {
                ErrorKind::Other
            }
        }
    }

    /// Driver code carried by this error, if any
    pub fn driver_code(&self) -> Option<&DriverCode> {
        match self {
            Self::Query { code, .. }
            | Self::Transaction { code, .. }
            | Self::RetryableWrite { code, .. }
            | Self::FatalWrite { code, .. }
            | Self::Commit { code, .. } => code.as_ref(),
            _ => None,
        }
    }

    /// The underlying message without the kind prefix
    pub fn message(&self) -> String {
        match self {
            Self::Connection { message, .. }
            | Self::Query { message, .. }
            | Self::Transaction { message, .. }
            | Self::SchemaMismatch { message }
            | Self::RetryableWrite { message, .. }
            | Self::FatalWrite { message, .. }
            | Self::Commit { message, .. }
            | Self::Cleanup { message, .. }
            | Self::Configuration { message }
            | Self::InvalidState { message }
            | Self::Unsupported { message }
            | Self::Internal { message } => message.clone(),
            Self::TableNotFound { table } => format!("table not found: {}", table),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            code: None,
        }
    }

    /// Create a query error carrying a driver code
    pub fn query_with_code(message: impl Into<String>, code: DriverCode) -> Self {
        Self::Query {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            code: None,
        }
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Create a table-not-found error
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Failure of a whole load as reported to the data pipeline
#[derive(Error, Debug)]
#[error("load failed ({kind}): {message}")]
pub struct LoadFailure {
    /// Error kind of the primary failure
    pub kind: ErrorKind,
    /// Last underlying driver message
    pub message: String,
    /// Intermediate table left behind for inspection, if any
    pub intermediate_table: Option<TableId>,
    /// The primary failure
    #[source]
    pub source: Error,
}

impl LoadFailure {
    /// Wrap a primary error
    pub fn new(source: Error, intermediate_table: Option<TableId>) -> Self {
        Self {
            kind: source.kind(),
            message: source.message(),
            intermediate_table,
            source,
        }
    }

    /// Whether an intermediate table was left behind
    #[inline]
    pub fn left_intermediate_table(&self) -> bool {
        self.intermediate_table.is_some()
    }
}
