//! Batch inserter
//!
//! Buffers converted rows for one table and writes each buffer as a single
//! multi-row INSERT. A flush is all rows of one buffer or none of them.
//!
//! State machine: `Idle -> Accumulating -> Flushing -> (Accumulating | Failed | Closed)`

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::config::BatchSettings;
use crate::connection::Connection;
use crate::dialect::DialectAdapter;
use crate::error::{Error, ErrorKind, Result};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::types::{Charset, ColumnDescriptor, TableId, Value};

/// Lifecycle of a [`BatchInserter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InserterState {
    /// Nothing accepted yet
    Idle,
    /// Rows buffered or buffer drained after a flush
    Accumulating,
    /// A flush is executing
    Flushing,
    /// A flush failed; no further writes
    Failed,
    /// Closed after the final flush
    Closed,
}

/// Insert statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InsertStats {
    /// Rows written by successful flushes
    pub rows_written: u64,
    /// Successful flushes
    pub flushes: u64,
    /// Statement executions, including failed and retried ones
    pub execute_attempts: u64,
    /// Executions that were retries of an earlier failed one
    pub retries: u64,
    /// Estimated bytes written
    pub bytes_written: u64,
    /// Time spent in successful flushes (milliseconds)
    pub write_time_ms: u64,
}

/// Atomic insert statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicInsertStats {
    pub rows_written: AtomicU64,
    pub flushes: AtomicU64,
    pub execute_attempts: AtomicU64,
    pub retries: AtomicU64,
    pub bytes_written: AtomicU64,
    pub write_time_ms: AtomicU64,
}

impl AtomicInsertStats {
    /// Record one statement execution
    pub fn record_attempt(&self, attempt: u32) {
        self.execute_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a successful flush
    pub fn record_flush(&self, rows: u64, bytes: u64, duration: Duration) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> InsertStats {
        InsertStats {
            rows_written: self.rows_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            execute_attempts: self.execute_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_time_ms: self.write_time_ms.load(Ordering::Relaxed),
        }
    }
}

/// Buffered multi-row writer for one table
pub struct BatchInserter<'c> {
    conn: &'c dyn Connection,
    dialect: Arc<dyn DialectAdapter>,
    table: TableId,
    columns: Vec<ColumnDescriptor>,
    charset: Charset,
    max_bytes: usize,
    row_cap: usize,
    retry: RetryPolicy,
    state: InserterState,
    buffer: Vec<Vec<Value>>,
    buffered_bytes: usize,
    stats: AtomicInsertStats,
}

impl<'c> BatchInserter<'c> {
    /// Create an inserter writing `columns` (in order) into `table`
    pub fn new(
        conn: &'c dyn Connection,
        dialect: Arc<dyn DialectAdapter>,
        table: TableId,
        columns: Vec<ColumnDescriptor>,
        settings: &BatchSettings,
        retry: RetryPolicy,
    ) -> Self {
        // keep rows * columns under the dialect's bind parameter limit
        let bind_cap = dialect.max_bind_parameters() / columns.len().max(1);
        let row_cap = settings.max_rows.min(bind_cap).max(1);
        Self {
            conn,
            dialect,
            table,
            columns,
            charset: Charset::Utf8,
            max_bytes: settings.max_bytes,
            row_cap,
            retry,
            state: InserterState::Idle,
            buffer: Vec::new(),
            buffered_bytes: 0,
            stats: AtomicInsertStats::default(),
        }
    }

    /// Charset used to estimate buffered bytes
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> InserterState {
        self.state
    }

    /// Rows currently buffered
    #[inline]
    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    /// Effective row threshold after the bind-parameter cap
    #[inline]
    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    /// Statistics snapshot
    pub fn stats(&self) -> InsertStats {
        self.stats.snapshot()
    }

    /// Buffer one row, flushing when a threshold is crossed
    pub async fn accept(&mut self, row: Vec<Value>) -> Result<()> {
        match self.state {
            InserterState::Closed => {
                return Err(Error::invalid_state("accept after close"));
            }
            InserterState::Failed => {
                return Err(Error::invalid_state("accept after a failed flush"));
            }
            InserterState::Flushing => {
                return Err(Error::invalid_state("accept during flush"));
            }
            InserterState::Idle | InserterState::Accumulating => {}
        }
        if row.len() != self.columns.len() {
            return Err(Error::schema_mismatch(format!(
                "row has {} values but {} has {} columns",
                row.len(),
                self.table,
                self.columns.len()
            )));
        }

        self.buffered_bytes += row
            .iter()
            .map(|v| v.estimated_size(self.charset))
            .sum::<usize>();
        self.buffer.push(row);
        self.state = InserterState::Accumulating;

        if self.buffer.len() >= self.row_cap || self.buffered_bytes >= self.max_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write the buffer as one multi-row insert, retrying classified-retryable failures
    pub async fn flush(&mut self) -> Result<()> {
        match self.state {
            InserterState::Closed | InserterState::Failed | InserterState::Flushing => {
                return Err(Error::invalid_state(format!(
                    "flush in state {:?}",
                    self.state
                )));
            }
            InserterState::Idle | InserterState::Accumulating => {}
        }
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.state = InserterState::Flushing;
        let rows = std::mem::take(&mut self.buffer);
        let bytes = std::mem::take(&mut self.buffered_bytes);
        let row_count = rows.len();

        let sql = match self
            .dialect
            .build_insert_sql(&self.table, &self.columns, row_count)
        {
            Ok(sql) => sql,
            Err(e) => {
                self.state = InserterState::Failed;
                return Err(e);
            }
        };
        let params: Vec<Value> = rows.into_iter().flatten().collect();

        let started = Instant::now();
        let conn = self.conn;
        let stats = &self.stats;
        let (sql_ref, params_ref) = (sql.as_str(), params.as_slice());
        let outcome = self
            .retry
            .run(self.dialect.as_ref(), "flush", |attempt| {
                stats.record_attempt(attempt);
                conn.execute(sql_ref, params_ref)
            })
            .await;

        match outcome {
            Ok((_, attempts)) => {
                let elapsed = started.elapsed();
                self.stats
                    .record_flush(row_count as u64, bytes as u64, elapsed);
                self.state = InserterState::Accumulating;
                debug!(
                    table = %self.table,
                    rows = row_count,
                    bytes,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "flushed batch"
                );
                Ok(())
            }
            Err(failure) => {
                self.state = InserterState::Failed;
                let err = write_error(failure);
                error!(table = %self.table, rows = row_count, error = %err, "batch flush failed");
                Err(err)
            }
        }
    }

    /// Flush remaining rows and close. Returns the final statistics.
    pub async fn close(&mut self) -> Result<InsertStats> {
        match self.state {
            InserterState::Closed => return Ok(self.stats()),
            InserterState::Failed => {
                return Err(Error::invalid_state("close after a failed flush"));
            }
            _ => {}
        }
        self.flush().await?;
        self.state = InserterState::Closed;
        Ok(self.stats())
    }
}

/// Turn an exhausted or fatal flush into the write error kinds
fn write_error(failure: RetryFailure) -> Error {
    let RetryFailure {
        error,
        attempts,
        class,
    } = failure;
    if error.kind() == ErrorKind::ConnectionFailure {
        return error;
    }
    let code = error.driver_code().cloned();
    if class.is_retryable() {
        Error::RetryableWrite {
            attempts,
            message: error.message(),
            code,
        }
    } else {
        Error::FatalWrite {
            message: error.message(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Transaction;
    use crate::dialect::SqliteDialect;
    use crate::error::{DriverCode, ErrorClass};
    use crate::types::Row;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records executed statements with their parameter counts
    #[derive(Default)]
    struct RecordingConnection {
        executed: Mutex<Vec<(String, usize)>>,
        fail_code: Option<i64>,
    }

    impl RecordingConnection {
        fn failing(code: i64) -> Self {
            Self {
                fail_code: Some(code),
                ..Default::default()
            }
        }

        fn executed(&self) -> Vec<(String, usize)> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            self.executed
                .lock()
                .unwrap()
                .push((sql.to_string(), params.len()));
            match self.fail_code {
                Some(code) => Err(Error::query_with_code("write failed", DriverCode::vendor(code))),
                None => Ok(params.len() as u64),
            }
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(Error::unsupported("recording connection has no transactions"))
        }

        async fn is_valid(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("id", "INT", false, 1),
            ColumnDescriptor::new("name", "TEXT", true, 2),
        ]
    }

    fn settings(max_rows: usize, max_bytes: usize) -> BatchSettings {
        BatchSettings {
            max_rows,
            max_bytes,
        }
    }

    fn inserter<'c>(conn: &'c RecordingConnection, settings: &BatchSettings) -> BatchInserter<'c> {
        BatchInserter::new(
            conn,
            Arc::new(SqliteDialect),
            TableId::new("orders_0a_bl_tmp").with_schema("main"),
            columns(),
            settings,
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_delays(Duration::from_millis(1), Duration::from_millis(1)),
        )
    }

    fn row(id: i32, name: &str) -> Vec<Value> {
        vec![Value::Int32(id), name.into()]
    }

    // ==================== Threshold Tests ====================

    #[tokio::test]
    async fn test_flush_when_max_bytes_crossed() {
        let conn = RecordingConnection::default();
        // each row estimates to 4 + 10 bytes
        let mut inserter = inserter(&conn, &settings(100, 30));

        inserter.accept(row(1, "0123456789")).await.unwrap();
        inserter.accept(row(2, "0123456789")).await.unwrap();
        assert!(conn.executed().is_empty());
        assert_eq!(inserter.buffered_rows(), 2);

        inserter.accept(row(3, "0123456789")).await.unwrap();
        assert_eq!(inserter.buffered_rows(), 0);
        assert_eq!(inserter.state(), InserterState::Accumulating);
        let executed = conn.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, 6);

        let stats = inserter.close().await.unwrap();
        assert_eq!(stats.rows_written, 3);
        assert_eq!(stats.bytes_written, 42);
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test]
    async fn test_flush_when_row_cap_reached() {
        let conn = RecordingConnection::default();
        let mut inserter = inserter(&conn, &settings(2, usize::MAX));
        for id in 1..=5 {
            inserter.accept(row(id, "x")).await.unwrap();
        }
        let stats = inserter.close().await.unwrap();

        let params: Vec<usize> = conn.executed().iter().map(|(_, n)| *n).collect();
        assert_eq!(params, vec![4, 4, 2]);
        assert_eq!(stats.rows_written, 5);
        assert_eq!(inserter.state(), InserterState::Closed);
    }

    #[test]
    fn test_row_cap_respects_bind_parameter_limit() {
        let conn = RecordingConnection::default();
        // 32_766 parameters / 2 columns
        assert_eq!(inserter(&conn, &settings(1_000_000, usize::MAX)).row_cap(), 16_383);
        assert_eq!(inserter(&conn, &settings(500, usize::MAX)).row_cap(), 500);

        let wide: Vec<ColumnDescriptor> = (1..=40_000)
            .map(|i| ColumnDescriptor::new(format!("c{}", i), "INT", true, i))
            .collect();
        let capped = BatchInserter::new(
            &conn,
            Arc::new(SqliteDialect),
            TableId::new("wide"),
            wide,
            &settings(1000, usize::MAX),
            RetryPolicy::default(),
        );
        assert_eq!(capped.row_cap(), 1);
    }

    // ==================== State Machine Tests ====================

    #[tokio::test]
    async fn test_accept_after_close_is_invalid() {
        let conn = RecordingConnection::default();
        let mut inserter = inserter(&conn, &settings(10, usize::MAX));
        inserter.accept(row(1, "a")).await.unwrap();
        inserter.close().await.unwrap();

        let err = inserter.accept(row(2, "b")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        // closing twice is harmless
        assert_eq!(inserter.close().await.unwrap().rows_written, 1);
        assert_eq!(conn.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_after_failed_flush_is_invalid() {
        // SQLITE_CONSTRAINT is fatal, so one attempt
        let conn = RecordingConnection::failing(19);
        let mut inserter = inserter(&conn, &settings(1, usize::MAX));

        let err = inserter.accept(row(1, "a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalWrite);
        assert_eq!(inserter.state(), InserterState::Failed);

        let err = inserter.accept(row(2, "b")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(matches!(inserter.close().await, Err(Error::InvalidState { .. })));
        assert_eq!(conn.executed().len(), 1);
        assert_eq!(inserter.stats().rows_written, 0);
    }

    #[tokio::test]
    async fn test_retryable_flush_exhausts_attempts() {
        // SQLITE_BUSY
        let conn = RecordingConnection::failing(5);
        let mut inserter = inserter(&conn, &settings(1, usize::MAX));

        let err = inserter.accept(row(1, "a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryableWrite);
        assert_eq!(conn.executed().len(), 2);
        assert_eq!(inserter.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_arity_mismatch_is_schema_mismatch() {
        let conn = RecordingConnection::default();
        let mut inserter = inserter(&conn, &settings(10, usize::MAX));

        let err = inserter.accept(vec![Value::Int32(1)]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert_eq!(inserter.state(), InserterState::Idle);
        assert_eq!(inserter.buffered_rows(), 0);

        // the inserter stays usable
        inserter.accept(row(1, "a")).await.unwrap();
        assert_eq!(inserter.close().await.unwrap().rows_written, 1);
    }

    #[tokio::test]
    async fn test_writes_into_other_namespace() {
        let conn = RecordingConnection::default();
        let mut inserter = BatchInserter::new(
            &conn,
            Arc::new(SqliteDialect),
            TableId::new("orders_0a_bl_tmp").with_schema("scratch"),
            columns(),
            &settings(10, usize::MAX),
            RetryPolicy::default(),
        );
        inserter.accept(row(1, "a")).await.unwrap();
        inserter.close().await.unwrap();

        let executed = conn.executed();
        assert_eq!(
            executed[0].0,
            "INSERT INTO \"scratch\".\"orders_0a_bl_tmp\" (\"id\", \"name\") VALUES (?, ?)"
        );
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = AtomicInsertStats::default();
        stats.record_attempt(1);
        stats.record_attempt(2);
        stats.record_flush(10, 400, Duration::from_millis(5));
        let snap = stats.snapshot();
        assert_eq!(snap.execute_attempts, 2);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.rows_written, 10);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.bytes_written, 400);
    }

    #[test]
    fn test_write_error_kinds() {
        let exhausted = write_error(RetryFailure {
            error: Error::query_with_code("deadlock", DriverCode::vendor(1213)),
            attempts: 3,
            class: ErrorClass::Retryable,
        });
        assert_eq!(exhausted.kind(), ErrorKind::RetryableWrite);
        assert_eq!(exhausted.driver_code(), Some(&DriverCode::vendor(1213)));

        let fatal = write_error(RetryFailure {
            error: Error::query("syntax"),
            attempts: 1,
            class: ErrorClass::Fatal,
        });
        assert_eq!(fatal.kind(), ErrorKind::FatalWrite);

        let lost = write_error(RetryFailure {
            error: Error::connection("reset by peer"),
            attempts: 1,
            class: ErrorClass::Fatal,
        });
        assert_eq!(lost.kind(), ErrorKind::ConnectionFailure);
    }
}
