//! Embedded SQLite transport over `rusqlite`
//!
//! Statements run on the blocking pool; the connection moves into the
//! blocking task and back. Failures keep SQLite's extended result code so
//! the dialect can tell busy/locked conditions from fatal ones.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::error::{DriverCode, Error, Result};
use crate::types::{Row, Value};

/// Option: milliseconds to wait on a locked database before failing with SQLITE_BUSY
pub const BUSY_TIMEOUT_OPTION: &str = "busyTimeout";
/// Option: `PRAGMA journal_mode` applied after opening
pub const JOURNAL_MODE_OPTION: &str = "journalMode";

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int8(n) => SqlValue::Integer(i64::from(*n)),
        Value::Int16(n) => SqlValue::Integer(i64::from(*n)),
        Value::Int32(n) => SqlValue::Integer(i64::from(*n)),
        Value::Int64(n) => SqlValue::Integer(*n),
        Value::Float32(n) => SqlValue::Real(f64::from(*n)),
        Value::Float64(n) => SqlValue::Real(*n),
        Value::Decimal(d) => SqlValue::Text(d.to_string()),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => SqlValue::Text(t.format("%H:%M:%S%.f").to_string()),
        Value::DateTime(dt) => SqlValue::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::DateTimeTz(dt) => SqlValue::Text(dt.to_rfc3339()),
        Value::Uuid(u) => SqlValue::Text(u.to_string()),
        Value::Json(j) => SqlValue::Text(j.to_string()),
    }
}

fn sql_to_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Int64(n),
        SqlValue::Real(f) => Value::Float64(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::Bytes(b),
    }
}

fn sqlite_error(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.unwrap_or_else(|| failure.to_string());
            Error::query_with_code(message, DriverCode::vendor(i64::from(failure.extended_code)))
        }
        other => Error::query(other.to_string()),
    }
}

type Rows = (Vec<String>, Vec<Vec<SqlValue>>);

fn query_rows(conn: &rusqlite::Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Rows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..width)
            .map(|i| row.get::<_, SqlValue>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push(values);
    }
    Ok((columns, out))
}

fn into_rows((columns, rows): Rows) -> Vec<Row> {
    rows.into_iter()
        .map(|values| {
            Row::new(
                columns.clone(),
                values.into_iter().map(sql_to_value).collect(),
            )
        })
        .collect()
}

struct Shared {
    conn: Mutex<Option<rusqlite::Connection>>,
    in_transaction: AtomicBool,
}

impl Shared {
    /// Run `f` with the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .take()
            .ok_or_else(|| Error::connection("connection not available"))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| Error::connection(format!("sqlite worker failed: {}", e)))?;
        *guard = Some(conn);
        result.map_err(sqlite_error)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(value_to_sql).collect();
        let rows = self.run(move |conn| query_rows(conn, &sql, &params)).await?;
        Ok(into_rows(rows))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(value_to_sql).collect();
        let affected = self
            .run(move |conn| conn.execute(&sql, rusqlite::params_from_iter(params.iter())))
            .await?;
        Ok(affected as u64)
    }
}

/// SQLite connection
pub struct SqliteConnection {
    shared: Arc<Shared>,
}

impl SqliteConnection {
    /// Open (or create) a database file
    pub async fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let path = path.into();
        let display = path.display().to_string();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| Error::connection(format!("sqlite worker failed: {}", e)))?
        .map_err(|e| Error::connection_with_source(format!("failed to open {}", display), e))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an open rusqlite connection
    pub fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(Some(conn)),
                in_transaction: AtomicBool::new(false),
            }),
        }
    }

    fn check_idle(&self) -> Result<()> {
        if self.shared.in_transaction.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("connection is inside a transaction"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.check_idle()?;
        self.shared.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.check_idle()?;
        self.shared.execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.check_idle()?;
        self.shared
            .run(|conn| conn.execute_batch("BEGIN IMMEDIATE"))
            .await
            .map_err(|e| Error::Transaction {
                message: e.message(),
                code: e.driver_code().cloned(),
            })?;
        self.shared.in_transaction.store(true, Ordering::SeqCst);
        Ok(Box::new(SqliteTransaction {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn is_valid(&self) -> bool {
        self.shared
            .run(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.shared.conn.lock().await.take() {
            conn.close()
                .map_err(|(_, e)| Error::connection_with_source("failed to close connection", e))?;
        }
        Ok(())
    }
}

/// SQLite transaction (`BEGIN IMMEDIATE` ... `COMMIT`/`ROLLBACK`)
pub struct SqliteTransaction {
    shared: Arc<Shared>,
}

impl SqliteTransaction {
    /// Run COMMIT or ROLLBACK. Returns the statement's outcome and whether
    /// SQLite is back in autocommit mode; only then is the connection idle.
    async fn finish(&self, sql: &'static str) -> Result<(Result<()>, bool)> {
        let (outcome, idle) = self
            .shared
            .run(move |conn| Ok((conn.execute_batch(sql), conn.is_autocommit())))
            .await?;
        if idle {
            self.shared.in_transaction.store(false, Ordering::SeqCst);
        }
        Ok((outcome.map_err(transaction_error), idle))
    }
}

fn transaction_error(err: rusqlite::Error) -> Error {
    let err = sqlite_error(err);
    Error::Transaction {
        message: err.message(),
        code: err.driver_code().cloned(),
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.shared.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.shared.execute(sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let (outcome, idle) = self.finish("COMMIT").await?;
        let Err(e) = outcome else {
            return Ok(());
        };
        // SQLITE_BUSY on COMMIT keeps the transaction open
        let rolled_back = idle || matches!(self.finish("ROLLBACK").await, Ok((Ok(()), true)));
        Err(Error::Commit {
            message: e.message(),
            code: e.driver_code().cloned(),
            rolled_back,
        })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let (outcome, _) = self.finish("ROLLBACK").await?;
        outcome
    }
}

/// Opens [`SqliteConnection`]s from `sqlite://<path>` URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnectionFactory;

impl SqliteConnectionFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

/// Database path of a `sqlite://` URL (a bare path is accepted too)
pub fn database_path(url: &str) -> Result<PathBuf> {
    let path = url.strip_prefix("sqlite://").unwrap_or(url);
    if path.is_empty() {
        return Err(Error::config("sqlite URL without a database path"));
    }
    Ok(PathBuf::from(path))
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let path = database_path(&config.url)?;
        let busy_ms = match config.properties.get(BUSY_TIMEOUT_OPTION) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::config(format!("option '{}' must be milliseconds", BUSY_TIMEOUT_OPTION))
            })?,
            None => DEFAULT_BUSY_TIMEOUT_MS,
        };
        let conn = SqliteConnection::open(path, Duration::from_millis(busy_ms)).await?;

        if let Some(mode) = config.properties.get(JOURNAL_MODE_OPTION) {
            let mode = mode.clone();
            conn.shared
                .run(move |c| {
                    // journal_mode answers with the resulting mode
                    c.pragma_update_and_check(None, "journal_mode", mode, |row| {
                        row.get::<_, String>(0)
                    })
                })
                .await?;
        }
        Ok(Box::new(conn))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}
