//! Load configuration
//!
//! [`LoadConfig`] is deserialized once at session start, validated with
//! `validator` plus [`LoadConfig::validate_semantics`], and then passed by
//! reference to the connector, dialect and coordinator.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use validator::Validate;

use crate::connection::DatabaseType;
use crate::error::{Error, Result};
use crate::merge::MergeRule;
use crate::security::{validate_merge_expression, validate_sql_identifier};
use crate::types::TableId;

/// A string that never shows up in logs or config dumps
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Only the transport calls this, when authenticating.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// How staged rows reach the target table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Target contents become the input records (swap strategy)
    #[default]
    Replace,
    /// Upsert staged rows into the target on the merge keys
    Merge,
}

/// Buffer thresholds for the batch inserter
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct BatchSettings {
    /// Flush when this many rows are buffered (default: 1000)
    #[serde(default = "default_max_rows")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_rows: usize,

    /// Flush when the estimated buffered size reaches this many bytes (default: 16 MiB)
    #[serde(default = "default_max_bytes")]
    #[validate(range(min = 1))]
    pub max_bytes: usize,
}

fn default_max_rows() -> usize {
    1000
}

fn default_max_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl BatchSettings {
    /// Set the row threshold
    pub fn with_max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows;
        self
    }

    /// Set the byte threshold
    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }
}

/// Retry settings for flushes and (optionally) commits
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct RetrySettings {
    /// Total execution attempts per flush, including the first (default: 12)
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 1000)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff multiplier (default: 2.0)
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0))]
    pub multiplier: f64,

    /// Upper bound for a single delay in milliseconds (default: 30 minutes)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Retry a failed commit attempt when the plan is idempotent (default: false)
    #[serde(default)]
    pub retry_commit: bool,
}

fn default_max_attempts() -> u32 {
    12
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30 * 60 * 1000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retry_commit: false,
        }
    }
}

/// Connect and socket timeouts for the two connection modes, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct TimeoutSettings {
    /// Connect timeout for metadata connections (default: 300000)
    #[serde(default = "default_connect_ms")]
    #[validate(range(min = 1))]
    pub metadata_connect_ms: u64,

    /// Socket timeout for metadata connections (default: 1800000)
    #[serde(default = "default_metadata_socket_ms")]
    pub metadata_socket_ms: u64,

    /// Connect timeout for bulk-write connections (default: 300000)
    #[serde(default = "default_connect_ms")]
    #[validate(range(min = 1))]
    pub bulk_connect_ms: u64,

    /// Socket timeout for bulk-write connections (default: 2700000)
    #[serde(default = "default_bulk_socket_ms")]
    pub bulk_socket_ms: u64,
}

fn default_connect_ms() -> u64 {
    300_000
}

fn default_metadata_socket_ms() -> u64 {
    1_800_000
}

fn default_bulk_socket_ms() -> u64 {
    2_700_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            metadata_connect_ms: default_connect_ms(),
            metadata_socket_ms: default_metadata_socket_ms(),
            bulk_connect_ms: default_connect_ms(),
            bulk_socket_ms: default_bulk_socket_ms(),
        }
    }
}

/// Option keys that would carry a credential past the redacted `password`
const CREDENTIAL_OPTIONS: &[&str] = &["password", "passwd", "pwd"];

/// Configuration of one load
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoadConfig {
    /// Database family
    pub dialect: DatabaseType,

    /// Server host (default: localhost)
    #[serde(default)]
    pub host: Option<String>,

    /// Server port (default: the dialect's port)
    #[serde(default)]
    pub port: Option<u16>,

    /// Database file for the embedded dialect
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// User name
    #[serde(default)]
    pub user: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Target namespace (database or schema)
    #[serde(default)]
    pub database: Option<String>,

    /// Namespace for the intermediate table (default: the target's)
    #[serde(default)]
    pub temp_database: Option<String>,

    /// Target table name
    #[validate(length(min = 1))]
    pub table: String,

    /// Dialect-specific transport options, layered over the connector
    /// defaults. Credentials are rejected here; they belong in `password`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Load mode
    #[serde(default)]
    pub mode: LoadMode,

    /// Key columns (required in merge mode)
    #[serde(default)]
    pub merge_keys: Vec<String>,

    /// Columns overwritten on conflict (default: all non-key columns)
    #[serde(default)]
    pub merge_columns: Option<Vec<String>>,

    /// Value-overwrite rule for matched rows
    #[serde(default)]
    pub merge_rule: MergeRule,

    /// Buffer thresholds
    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchSettings,

    /// Retry policy
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Timeout profiles
    #[serde(default)]
    #[validate(nested)]
    pub timeouts: TimeoutSettings,

    /// Keep the intermediate table when the load fails
    #[serde(default)]
    pub preserve_intermediate_table: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            dialect: DatabaseType::SQLite,
            host: None,
            port: None,
            path: None,
            user: None,
            password: None,
            database: None,
            temp_database: None,
            table: String::new(),
            options: BTreeMap::new(),
            mode: LoadMode::Replace,
            merge_keys: Vec::new(),
            merge_columns: None,
            merge_rule: MergeRule::Replace,
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            preserve_intermediate_table: false,
        }
    }
}

impl LoadConfig {
    /// Run field validation and the cross-field checks
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Validation failed: {}", e)))?;
        self.validate_semantics()
    }

    /// Cross-field checks that `validator` cannot express
    pub fn validate_semantics(&self) -> Result<()> {
        validate_sql_identifier(&self.table)?;
        for ns in [&self.database, &self.temp_database].into_iter().flatten() {
            validate_sql_identifier(ns)?;
        }

        match self.mode {
            LoadMode::Merge if self.merge_keys.is_empty() => {
                return Err(Error::config("'merge_keys' required for merge mode"));
            }
            LoadMode::Replace if !self.merge_keys.is_empty() => {
                return Err(Error::config("'merge_keys' only apply to merge mode"));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for key in &self.merge_keys {
            validate_sql_identifier(key)?;
            if !seen.insert(key.to_ascii_lowercase()) {
                return Err(Error::config(format!("duplicate merge key '{}'", key)));
            }
        }
        if let Some(cols) = &self.merge_columns {
            for col in cols {
                validate_sql_identifier(col)?;
            }
        }
        if let MergeRule::Expressions(exprs) = &self.merge_rule {
            if self.mode != LoadMode::Merge {
                return Err(Error::config("'merge_rule' expressions require merge mode"));
            }
            for (col, expr) in exprs {
                validate_sql_identifier(col)?;
                validate_merge_expression(expr)?;
            }
        }

        if let Some(key) = self
            .options
            .keys()
            .find(|k| CREDENTIAL_OPTIONS.iter().any(|c| c.eq_ignore_ascii_case(k)))
        {
            return Err(Error::config(format!(
                "option '{}' is not allowed; set 'password' instead",
                key
            )));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::config(
                "'retry.max_delay_ms' must not be smaller than 'retry.base_delay_ms'",
            ));
        }
        if self.dialect == DatabaseType::SQLite && self.path.is_none() {
            return Err(Error::config("'path' required for the sqlite dialect"));
        }
        Ok(())
    }

    /// Target table identifier as configured (not yet canonicalized)
    pub fn target_table(&self) -> TableId {
        let id = TableId::new(&self.table);
        match &self.database {
            Some(db) => id.with_schema(db),
            None => id,
        }
    }

    /// Effective server host
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    /// Effective server port
    pub fn port(&self) -> Option<u16> {
        self.port.or_else(|| self.dialect.default_port())
    }

    /// Whether merge mode with keys is active
    pub fn is_merge(&self) -> bool {
        self.mode == LoadMode::Merge && !self.merge_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_config() -> LoadConfig {
        LoadConfig {
            path: Some(PathBuf::from("/tmp/load.db")),
            table: "users".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_from_json() {
        let config: LoadConfig =
            serde_json::from_str(r#"{"dialect": "mysql", "table": "users", "database": "app"}"#)
                .unwrap();

        assert_eq!(config.dialect, DatabaseType::MySQL);
        assert_eq!(config.batch.max_rows, 1000);
        assert_eq!(config.retry.max_attempts, 12);
        assert!(!config.retry.retry_commit);
        assert_eq!(config.timeouts.bulk_socket_ms, 2_700_000);
        assert_eq!(config.mode, LoadMode::Replace);
        assert_eq!(config.port(), Some(3306));
        assert_eq!(config.target_table().qualified_name(), "app.users");
        assert!(config.ensure_valid().is_ok());
    }

    #[test]
    fn test_merge_mode_requires_keys() {
        let config = LoadConfig {
            mode: LoadMode::Merge,
            ..sqlite_config()
        };
        assert!(config.validate_semantics().is_err());

        let config = LoadConfig {
            mode: LoadMode::Merge,
            merge_keys: vec!["id".into()],
            ..sqlite_config()
        };
        assert!(config.validate_semantics().is_ok());
        assert!(config.is_merge());
    }

    #[test]
    fn test_duplicate_merge_keys_rejected() {
        let config = LoadConfig {
            mode: LoadMode::Merge,
            merge_keys: vec!["id".into(), "ID".into()],
            ..sqlite_config()
        };
        let err = config.validate_semantics().unwrap_err();
        assert!(err.to_string().contains("duplicate merge key"));
    }

    #[test]
    fn test_field_validation() {
        let mut config = sqlite_config();
        config.retry.max_attempts = 0;
        assert!(config.ensure_valid().is_err());

        let mut config = sqlite_config();
        config.retry.multiplier = 0.5;
        assert!(config.ensure_valid().is_err());

        let config = LoadConfig {
            table: String::new(),
            ..sqlite_config()
        };
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn test_injection_in_table_rejected() {
        let config = LoadConfig {
            table: "users; DROP TABLE x".into(),
            ..sqlite_config()
        };
        assert!(config.validate_semantics().is_err());
    }

    #[test]
    fn test_credential_options_rejected() {
        let mut config = sqlite_config();
        config.options.insert("Password".into(), "tiger".into());
        let err = config.validate_semantics().unwrap_err();
        assert!(err.to_string().contains("'Password'"));
        assert!(!err.to_string().contains("tiger"));

        let mut config = sqlite_config();
        config.options.insert("busyTimeout".into(), "100".into());
        assert!(config.validate_semantics().is_ok());
    }

    #[test]
    fn test_sensitive_string_redacted() {
        let config: LoadConfig = serde_json::from_str(
            r#"{"dialect": "oracle", "table": "T", "password": "tiger"}"#,
        )
        .unwrap();
        let password = config.password.as_ref().unwrap();
        assert_eq!(password.expose_secret(), "tiger");
        assert_eq!(format!("{}", password), "[REDACTED]");
        assert!(!format!("{:?}", config).contains("tiger"));
        assert!(!serde_json::to_string(&config).unwrap().contains("tiger"));
    }
}
