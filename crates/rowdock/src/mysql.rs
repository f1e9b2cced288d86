//! MySQL transport over `mysql_async`
//!
//! - Throughput options from the connector (`useCompression`, `tcpKeepAlive`)
//!   map onto the driver's options; multi-row inserts are already one
//!   statement per flush, which is what `rewriteBatchedStatements` asks for.
//! - The socket timeout bounds every statement round trip.
//! - Server errors keep their vendor code and SQLSTATE for classification.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::error::{DriverCode, Error, Result};
use crate::types::{Row, Value};

/// TCP keepalive interval used when `tcpKeepAlive` is on
const KEEPALIVE_MS: u32 = 60_000;

/// Convert a value to a MySQL parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int8(n) => mysql_async::Value::from(*n),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        // exact decimal travels as text
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

fn datetime_to_sql(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    let (date, time) = (dt.date(), dt.time());
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

/// Convert a MySQL result value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => match i64::try_from(n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::String(n.to_string()),
        },
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                return Value::Date(date);
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(|time| Value::DateTime(chrono::NaiveDateTime::new(date, time)))
                .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if neg || days > 0 {
                // outside time-of-day; keep the server's textual form
                let sign = if neg { "-" } else { "" };
                let hours = days * 24 + hour as u32;
                return Value::String(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, min, sec, micro
                ));
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
    }
}

/// Map a driver error, keeping server codes for classification
fn driver_error(context: &str, err: mysql_async::Error) -> Error {
    match err {
        mysql_async::Error::Server(server) => Error::query_with_code(
            format!("{}: {}", context, server.message),
            DriverCode::vendor(i64::from(server.code)).with_sql_state(server.state),
        ),
        mysql_async::Error::Io(e) => {
            Error::connection_with_source(format!("{}: connection lost", context), e)
        }
        mysql_async::Error::Driver(e) => Error::connection_with_source(context.to_string(), e),
        other => Error::query(format!("{}: {}", context, other)),
    }
}

fn convert_rows(result: Vec<mysql_async::Row>) -> Vec<Row> {
    result
        .into_iter()
        .map(|row| {
            let columns: Vec<String> = row
                .columns_ref()
                .iter()
                .map(|c| c.name_str().to_string())
                .collect();
            let values: Vec<Value> = (0..row.len())
                .map(|i| {
                    let val: mysql_async::Value = row.get(i).unwrap_or(mysql_async::Value::NULL);
                    mysql_value_to_value(val)
                })
                .collect();
            Row::new(columns, values)
        })
        .collect()
}

/// Bound a round trip by the socket timeout (zero disables)
async fn timed<T, F>(timeout: Duration, context: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, mysql_async::Error>>,
{
    if timeout.is_zero() {
        return fut.await.map_err(|e| driver_error(context, e));
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| driver_error(context, e)),
        Err(_) => Err(Error::connection(format!(
            "{}: socket timeout after {}ms",
            context,
            timeout.as_millis()
        ))),
    }
}

/// Driver options for a connection configuration
fn build_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let url = url::Url::parse(&config.url)
        .map_err(|e| Error::config(format!("invalid MySQL URL: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::config("MySQL URL without host"))?;
    let database = url.path().trim_start_matches('/');

    let mut opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(url.port().unwrap_or(3306))
        .user(config.user.clone())
        .db_name((!database.is_empty()).then(|| database.to_string()));
    if config.bool_property("useCompression").unwrap_or(false) {
        opts = opts.compression(Some(mysql_async::Compression::default()));
    }
    if config.bool_property("tcpKeepAlive").unwrap_or(false) {
        opts = opts.tcp_keepalive(Some(KEEPALIVE_MS));
    }
    // credentials last
    if let Some(password) = &config.password {
        opts = opts.pass(Some(password.expose_secret().to_string()));
    }
    Ok(opts)
}

/// MySQL connection
pub struct MySqlConnection {
    conn: Arc<Mutex<Option<Conn>>>,
    in_transaction: Arc<AtomicBool>,
    socket_timeout: Duration,
}

impl MySqlConnection {
    /// Wrap an established driver connection
    pub fn new(conn: Conn, socket_timeout: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            in_transaction: Arc::new(AtomicBool::new(false)),
            socket_timeout,
        }
    }

    /// Connect with a transport configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let opts = build_opts(config)?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect to MySQL", e))?;
        Ok(Self::new(conn, Duration::from_millis(config.socket_timeout_ms)))
    }

    async fn take_conn(&self) -> Result<Conn> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("connection is inside a transaction"));
        }
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::connection("connection not available"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.take_conn().await?;
        let params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let result = timed(
            self.socket_timeout,
            "query failed",
            conn.exec::<mysql_async::Row, _, _>(sql, params),
        )
        .await;
        self.put_conn(conn).await;
        Ok(convert_rows(result?))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut conn = self.take_conn().await?;
        let params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let result = timed(
            self.socket_timeout,
            "statement failed",
            conn.exec_drop(sql, params),
        )
        .await;
        let affected = conn.affected_rows();
        self.put_conn(conn).await;
        result.map(|_| affected)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut conn = self.take_conn().await?;
        if let Err(e) = timed(self.socket_timeout, "BEGIN failed", conn.query_drop("BEGIN")).await {
            self.put_conn(conn).await;
            return Err(Error::Transaction {
                message: e.message(),
                code: e.driver_code().cloned(),
            });
        }
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(Box::new(MySqlTransaction {
            conn: Mutex::new(Some(conn)),
            parent_conn: self.conn.clone(),
            in_transaction: Arc::clone(&self.in_transaction),
            socket_timeout: self.socket_timeout,
        }))
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| Error::connection_with_source("failed to close connection", e))?;
        }
        Ok(())
    }
}

/// MySQL transaction.
///
/// Runs manual BEGIN/COMMIT/ROLLBACK on a connection taken from its parent
/// and hands it back when finished.
pub struct MySqlTransaction {
    conn: Mutex<Option<Conn>>,
    parent_conn: Arc<Mutex<Option<Conn>>>,
    in_transaction: Arc<AtomicBool>,
    socket_timeout: Duration,
}

impl MySqlTransaction {
    async fn finish(&self, sql: &'static str) -> Result<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Err(Error::transaction("transaction already completed"));
        };
        let result = timed(self.socket_timeout, sql, conn.query_drop(sql)).await;
        *self.parent_conn.lock().await = Some(conn);
        self.in_transaction.store(false, Ordering::SeqCst);
        result.map_err(|e| Error::Transaction {
            message: e.message(),
            code: e.driver_code().cloned(),
        })
    }
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::transaction("transaction not available"))?;
        let params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let result = timed(
            self.socket_timeout,
            "query failed",
            conn.exec::<mysql_async::Row, _, _>(sql, params),
        )
        .await?;
        Ok(convert_rows(result))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::transaction("transaction not available"))?;
        let params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        timed(
            self.socket_timeout,
            "statement failed",
            conn.exec_drop(sql, params),
        )
        .await?;
        Ok(conn.affected_rows())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Err(Error::transaction("transaction already completed"));
        };
        let committed = timed(self.socket_timeout, "COMMIT", conn.query_drop("COMMIT")).await;
        let outcome = match committed {
            Ok(()) => Ok(()),
            Err(e) => {
                let rolled_back = timed(self.socket_timeout, "ROLLBACK", conn.query_drop("ROLLBACK"))
                    .await
                    .is_ok();
                Err(Error::Commit {
                    message: e.message(),
                    code: e.driver_code().cloned(),
                    rolled_back,
                })
            }
        };
        *self.parent_conn.lock().await = Some(conn);
        self.in_transaction.store(false, Ordering::SeqCst);
        outcome
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

/// Opens [`MySqlConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnectionFactory;

impl MySqlConnectionFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MySqlConnection::connect(config).await?))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }
}
