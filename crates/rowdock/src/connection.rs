//! Transport traits for rowdock
//!
//! The network driver is an external collaborator reached through a narrow
//! interface:
//! - Connection: statement execution and transaction start
//! - Transaction: statement execution inside an open transaction
//! - ConnectionFactory: connection establishment from a [`ConnectionConfig`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SensitiveString;
use crate::error::Result;
use crate::types::{Row, Value};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A database transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Commit the transaction.
    ///
    /// A failed COMMIT must not leave the transaction open: the transport
    /// rolls back and reports [`crate::error::Error::Commit`] with
    /// `rolled_back` telling whether that worked.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Configuration handed to a [`ConnectionFactory`] for one connection attempt
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Connection URL without credentials (e.g., mysql://host:3306/db)
    pub url: String,
    /// User name
    pub user: Option<String>,
    /// Password, applied last by the transport and never logged
    pub password: Option<SensitiveString>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Socket read timeout in milliseconds (0 = no timeout)
    pub socket_timeout_ms: u64,
    /// Effective transport options after layering
    pub properties: BTreeMap<String, String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redact credentials from the URL as well, in case the caller embedded them.
        let redacted_url = match url::Url::parse(&self.url) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => "***".to_string(),
        };

        f.debug_struct("ConnectionConfig")
            .field("url", &redacted_url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("socket_timeout_ms", &self.socket_timeout_ms)
            .field("properties", &self.properties)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            password: None,
            connect_timeout_ms: 10_000,
            socket_timeout_ms: 30_000,
            properties: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set socket read timeout
    pub fn with_socket_timeout(mut self, ms: u64) -> Self {
        self.socket_timeout_ms = ms;
        self
    }

    /// Set the user name
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: SensitiveString) -> Self {
        self.password = Some(password);
        self
    }

    /// Add a connection property, replacing an existing value
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Boolean property lookup (`true`/`false`, case-insensitive)
    pub fn bool_property(&self, key: &str) -> Option<bool> {
        self.properties
            .get(key)
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            })
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Get the database type
    fn database_type(&self) -> DatabaseType;
}

/// Database family identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// MySQL/MariaDB
    MySQL,
    /// Oracle
    Oracle,
    /// SQLite
    SQLite,
}

impl DatabaseType {
    /// Default TCP port, if the family uses one
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::MySQL => Some(3306),
            Self::Oracle => Some(1521),
            Self::SQLite => None,
        }
    }

    /// URL scheme used when assembling connection URLs
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::MySQL => "mysql",
            Self::Oracle => "oracle",
            Self::SQLite => "sqlite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MySQL => write!(f, "MySQL"),
            Self::Oracle => write!(f, "Oracle"),
            Self::SQLite => write!(f, "SQLite"),
        }
    }
}
