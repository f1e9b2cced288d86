//! Shared helpers for integration tests: a SQLite database in a temp
//! directory and a connection wrapper that injects driver failures.

#![allow(dead_code)]

use async_trait::async_trait;
use rowdock::prelude::*;
use rowdock::sqlite::SqliteConnectionFactory;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A SQLite database file that lives as long as the value
pub struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TestDb {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.db");
        Self { _dir: dir, path }
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    /// Load configuration for `table` with fast retries
    pub fn config(&self, table: &str) -> LoadConfig {
        let mut config = LoadConfig {
            dialect: DatabaseType::SQLite,
            path: Some(self.path.clone()),
            table: table.to_string(),
            ..Default::default()
        };
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config
    }

    pub fn merge_config(&self, table: &str, keys: &[&str]) -> LoadConfig {
        let mut config = self.config(table);
        config.mode = LoadMode::Merge;
        config.merge_keys = keys.iter().map(|k| k.to_string()).collect();
        config
    }

    pub async fn connect(&self) -> Box<dyn Connection> {
        SqliteConnectionFactory::new()
            .connect(&ConnectionConfig::new(self.url()))
            .await
            .unwrap()
    }

    pub async fn exec(&self, sql: &str) {
        let conn = self.connect().await;
        conn.execute(sql, &[]).await.unwrap();
        conn.close().await.unwrap();
    }

    /// All rows of `sql` as value vectors
    pub async fn rows(&self, sql: &str) -> Vec<Vec<Value>> {
        let conn = self.connect().await;
        let rows = conn.query(sql, &[]).await.unwrap();
        conn.close().await.unwrap();
        rows.into_iter().map(|r| r.values().to_vec()).collect()
    }

    /// User tables, sorted
    pub async fn tables(&self) -> Vec<String> {
        self.rows("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .await
            .into_iter()
            .filter_map(|r| r[0].as_string())
            .collect()
    }

    /// Tables whose name marks them as intermediate tables
    pub async fn intermediate_tables(&self) -> Vec<String> {
        self.tables()
            .await
            .into_iter()
            .filter(|t| t.ends_with("_bl_tmp"))
            .collect()
    }
}

/// `(id INT, name VARCHAR, score BIGINT)` source schema
pub fn scores_schema() -> SourceSchema {
    SourceSchema::new(vec![
        SourceColumn::new("id", LogicalType::Int).not_null(),
        SourceColumn::new("name", LogicalType::String { max_length: Some(32) }),
        SourceColumn::new("score", LogicalType::BigInt),
    ])
}

pub fn score_row(id: i32, name: &str, score: i64) -> Vec<Value> {
    vec![Value::Int32(id), name.into(), Value::Int64(score)]
}

/// Expected row as read back from SQLite
pub fn stored(id: i64, name: &str, score: i64) -> Vec<Value> {
    vec![Value::Int64(id), name.into(), Value::Int64(score)]
}

pub fn batches(rows: Vec<Vec<Value>>) -> futures::stream::Iter<std::vec::IntoIter<RecordBatch>> {
    futures::stream::iter(vec![RecordBatch::new(rows)])
}

// ==================== Fault injection ====================

/// Failure kinds a wrapped connection can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// SQLITE_BUSY, classified retryable
    Busy,
    /// SQLITE_CONSTRAINT, classified fatal
    Fatal,
}

impl Fault {
    fn error(self) -> Error {
        match self {
            Fault::Busy => Error::query_with_code("database is locked", DriverCode::vendor(5)),
            Fault::Fatal => Error::query_with_code("constraint failed", DriverCode::vendor(19)),
        }
    }
}

/// What to break, and a log of what ran
#[derive(Default)]
pub struct FaultPlan {
    /// Consumed by successive bulk INSERT executions, one fault per attempt
    pub insert_faults: Mutex<VecDeque<Fault>>,
    /// Fail with the fault right after the Nth statement inside a transaction has run (1-based)
    pub fail_after_tx_statement: Mutex<Option<(u32, Fault)>>,
    /// Consumed by successive COMMITs; an armed one rolls back and fails
    pub commit_faults: Mutex<VecDeque<Fault>>,
    /// Make DROP TABLE statements fail
    pub fail_drops: AtomicBool,
    /// INSERT executions outside transactions, including failed ones
    pub insert_attempts: AtomicU32,
    /// Statements run inside transactions
    pub tx_statements: AtomicU32,
    /// COMMIT attempts, including failed ones
    pub commit_attempts: AtomicU32,
    /// DROP TABLE executions, including failed ones
    pub drop_attempts: AtomicU32,
    /// Every statement passed to execute
    pub log: Mutex<Vec<String>>,
}

impl FaultPlan {
    pub fn with_insert_faults(faults: &[Fault]) -> Self {
        let plan = Self::default();
        plan.insert_faults.lock().unwrap().extend(faults.iter().copied());
        plan
    }

    pub fn failing_tx_statement(n: u32, fault: Fault) -> Self {
        let plan = Self::default();
        *plan.fail_after_tx_statement.lock().unwrap() = Some((n, fault));
        plan
    }

    pub fn with_commit_faults(faults: &[Fault]) -> Self {
        let plan = Self::default();
        plan.commit_faults.lock().unwrap().extend(faults.iter().copied());
        plan
    }

    pub fn commits(&self) -> u32 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> u32 {
        self.drop_attempts.load(Ordering::SeqCst)
    }
}

/// Factory wrapping SQLite connections with a shared [`FaultPlan`]
pub struct FaultyFactory {
    pub plan: Arc<FaultPlan>,
}

impl FaultyFactory {
    pub fn new(plan: FaultPlan) -> (Arc<Self>, Arc<FaultPlan>) {
        let plan = Arc::new(plan);
        (
            Arc::new(Self {
                plan: Arc::clone(&plan),
            }),
            plan,
        )
    }
}

#[async_trait]
impl ConnectionFactory for FaultyFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let inner = SqliteConnectionFactory::new().connect(config).await?;
        Ok(Box::new(FaultyConnection {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

struct FaultyConnection {
    inner: Box<dyn Connection>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl Connection for FaultyConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.plan.log.lock().unwrap().push(sql.to_string());
        if sql.starts_with("INSERT") {
            self.plan.insert_attempts.fetch_add(1, Ordering::SeqCst);
            let fault = self.plan.insert_faults.lock().unwrap().pop_front();
            if let Some(fault) = fault {
                return Err(fault.error());
            }
        }
        if sql.starts_with("DROP TABLE") {
            self.plan.drop_attempts.fetch_add(1, Ordering::SeqCst);
            if self.plan.fail_drops.load(Ordering::SeqCst) {
                return Err(Error::query_with_code("disk I/O error", DriverCode::vendor(10)));
            }
        }
        self.inner.execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(FaultyTransaction {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    async fn is_valid(&self) -> bool {
        self.inner.is_valid().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct FaultyTransaction {
    inner: Box<dyn Transaction>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl Transaction for FaultyTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.plan.log.lock().unwrap().push(sql.to_string());
        let n = self.plan.tx_statements.fetch_add(1, Ordering::SeqCst) + 1;
        let affected = self.inner.execute(sql, params).await?;
        let planned = *self.plan.fail_after_tx_statement.lock().unwrap();
        if let Some((at, fault)) = planned {
            if at == n {
                return Err(fault.error());
            }
        }
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.plan.commit_attempts.fetch_add(1, Ordering::SeqCst);
        let fault = self.plan.commit_faults.lock().unwrap().pop_front();
        match fault {
            // a transport whose COMMIT failed rolls back before reporting
            Some(fault) => {
                let error = fault.error();
                let rolled_back = self.inner.rollback().await.is_ok();
                Err(Error::Commit {
                    message: error.message(),
                    code: error.driver_code().cloned(),
                    rolled_back,
                })
            }
            None => self.inner.commit().await,
        }
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}
