//! # rowdock
//!
//! Transactional bulk loading of record streams into relational tables.
//!
//! A load stages every incoming row in a session-unique intermediate table
//! through batched multi-row inserts, then moves the staged rows into the
//! target in one transaction: a swap that replaces the target's contents,
//! or a keyed merge (upsert). A failed load never leaves the target
//! partially written.
//!
//! ## Features
//!
//! - **Dialect adapters**: MySQL, Oracle and SQLite type mapping, DDL/DML generation and
//!   retryable-error classification behind one trait
//! - **Classified retry**: deadlocks and lock timeouts are retried with exponential backoff;
//!   everything else fails fast
//! - **Swap or merge commit**: atomic rename or delete-then-insert, keyed upsert with
//!   replace, keep-existing or per-column expression rules
//! - **Timeout profiles**: separate connect/socket timeouts for metadata and bulk-write
//!   connections
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rowdock::prelude::*;
//!
//! let config = LoadConfig {
//!     dialect: DatabaseType::SQLite,
//!     path: Some("warehouse.db".into()),
//!     table: "scores".into(),
//!     mode: LoadMode::Merge,
//!     merge_keys: vec!["id".into()],
//!     ..Default::default()
//! };
//! let coordinator = LoadCoordinator::new(config, Arc::new(SqliteConnectionFactory::new()))?;
//!
//! let source = SourceSchema::new(vec![
//!     SourceColumn::new("id", LogicalType::Int).not_null(),
//!     SourceColumn::new("name", LogicalType::String { max_length: Some(64) }),
//!     SourceColumn::new("score", LogicalType::BigInt),
//! ]);
//! let batches = futures::stream::iter(vec![RecordBatch::new(vec![
//!     vec![Value::Int32(1), "b".into(), Value::Int64(20)],
//!     vec![Value::Int32(2), "c".into(), Value::Int64(30)],
//! ])]);
//!
//! let report = coordinator.run(source, batches).await?;
//! println!("{} rows via {}", report.rows, report.strategy);
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - embedded SQLite transport via rusqlite
//! - `mysql` - MySQL/MariaDB transport via mysql_async
//! - `full` - All transports
//!
//! The Oracle adapter generates SQL for any [`connection::Connection`] the
//! caller supplies; no Oracle transport ships with the crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod batch;
pub mod config;
pub mod connection;
pub mod connector;
pub mod coordinator;
pub mod dialect;
pub mod error;
pub mod merge;
pub mod retry;
pub mod schema;
pub mod security;
pub mod types;

// Transports (conditionally compiled)
#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Prelude module for convenient imports
pub mod prelude {
    pub use std::sync::Arc;

    // Error types
    pub use crate::error::{DriverCode, Error, ErrorClass, ErrorKind, LoadFailure, Result};

    // Data model
    pub use crate::types::{
        Charset, ColumnDescriptor, LogicalType, RecordBatch, Row, SourceColumn, SourceSchema,
        TableId, TableSchema, Value,
    };

    // Transport interface
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction,
    };

    // Configuration
    pub use crate::config::{
        BatchSettings, LoadConfig, LoadMode, RetrySettings, SensitiveString, TimeoutSettings,
    };

    // Engine
    pub use crate::batch::{BatchInserter, InsertStats, InserterState};
    pub use crate::connector::{ConnectionMode, Connector, TimeoutProfile};
    pub use crate::coordinator::{LoadCoordinator, LoadReport, LoadSession};
    pub use crate::dialect::{
        dialect_for, DialectAdapter, MySqlDialect, OracleDialect, SqliteDialect, UpsertMatch,
    };
    pub use crate::merge::{
        ColumnUpdate, CommitPlan, CommitStrategy, MergeConfig, MergePlanner, MergeRule, MergeSpec,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::schema::SchemaIntrospector;

    #[cfg(feature = "mysql")]
    pub use crate::mysql::MySqlConnectionFactory;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteConnectionFactory;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _config = ConnectionConfig::new("mysql://localhost/test");
        let _batch = BatchSettings::default();
        assert_eq!(LoadMode::default(), LoadMode::Replace);
    }

    #[test]
    fn test_error_kinds() {
        let err = Error::connection("test error");
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    }

    #[test]
    fn test_dialect_selection() {
        assert_eq!(dialect_for(DatabaseType::MySQL).name(), "MySQL");
        assert_eq!(dialect_for(DatabaseType::Oracle).name(), "Oracle");
        assert_eq!(dialect_for(DatabaseType::SQLite).name(), "SQLite");
    }
}
