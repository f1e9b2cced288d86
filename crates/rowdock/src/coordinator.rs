//! Load coordinator
//!
//! Drives one load end to end:
//!
//! 1. open a metadata connection, canonicalize the target and resolve the charset
//! 2. create the intermediate table
//! 3. stream every record batch through a [`BatchInserter`] on a bulk-write connection
//! 4. on a failed write, drop the intermediate table and report; nothing is committed
//! 5. otherwise commit through the [`MergePlanner`] and drop the intermediate table
//! 6. report row counts or the primary failure
//!
//! Cleanup is best effort: a failed drop is logged and never replaces the
//! primary outcome.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchInserter, InsertStats};
use crate::config::LoadConfig;
use crate::connection::{Connection, ConnectionFactory};
use crate::connector::{ConnectionMode, Connector};
use crate::dialect::{dialect_for, DialectAdapter};
use crate::error::{Error, LoadFailure, Result};
use crate::merge::{CommitPlan, CommitStrategy, MergeConfig, MergePlanner};
use crate::retry::RetryPolicy;
use crate::schema::{validate_row, SchemaIntrospector};
use crate::security::validate_sql_identifier;
use crate::types::{Charset, ColumnDescriptor, RecordBatch, SourceSchema, TableId, TableSchema};

/// Suffix of intermediate table names
pub const INTERMEDIATE_SUFFIX: &str = "_bl_tmp";

/// Hex characters of the session-unique part of an intermediate table name
const SESSION_TAG_LEN: usize = 12;

/// Outcome of a successful load
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// Canonical target table
    pub target: TableId,
    /// Rows written to the intermediate table
    pub rows: u64,
    /// How the staged rows reached the target
    pub strategy: CommitStrategy,
    /// Rows affected by the commit statements, as reported by the driver
    pub commit_rows_affected: u64,
    /// Server charset used for size estimates
    pub charset: Charset,
    /// Insert statistics
    pub stats: InsertStats,
    /// Wall time of the whole load
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// State of one load against one target table
#[derive(Debug, Clone)]
pub struct LoadSession {
    /// Canonical target table
    pub target: TableId,
    /// Session-unique intermediate table
    pub intermediate: TableId,
    /// Target schema, when the target already existed
    pub target_schema: Option<TableSchema>,
    /// Schema the intermediate table is created with
    pub intermediate_schema: TableSchema,
    /// Merge configuration, in merge mode
    pub merge: Option<MergeConfig>,
    /// Chosen commit plan
    pub plan: CommitPlan,
    /// Server charset
    pub charset: Charset,
    /// Retry policy for flushes and (opt-in) commits
    pub retry: RetryPolicy,
}

impl LoadSession {
    /// Whether the target existed when the session was prepared
    #[inline]
    pub fn target_exists(&self) -> bool {
        self.target_schema.is_some()
    }
}

/// Runs loads for one configuration
#[derive(Debug)]
pub struct LoadCoordinator {
    config: LoadConfig,
    dialect: Arc<dyn DialectAdapter>,
    connector: Connector,
    introspector: SchemaIntrospector,
    planner: MergePlanner,
}

impl LoadCoordinator {
    /// Create a coordinator using the configured dialect
    pub fn new(config: LoadConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let dialect = dialect_for(config.dialect);
        Self::with_dialect(config, dialect, factory)
    }

    /// Create a coordinator with an explicit dialect adapter
    pub fn with_dialect(
        config: LoadConfig,
        dialect: Arc<dyn DialectAdapter>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.ensure_valid()?;
        let connector = Connector::new(&config, dialect.clone(), factory)?;
        Ok(Self {
            introspector: SchemaIntrospector::new(dialect.clone()),
            planner: MergePlanner::new(dialect.clone()),
            config,
            dialect,
            connector,
        })
    }

    /// Configuration of this coordinator
    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Connector used for every connection of a load
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Load `batches` into the configured target
    pub async fn run<S>(
        &self,
        source: SourceSchema,
        batches: S,
    ) -> std::result::Result<LoadReport, LoadFailure>
    where
        S: Stream<Item = RecordBatch>,
    {
        let started = Instant::now();
        let meta = self
            .connector
            .open(ConnectionMode::Metadata)
            .await
            .map_err(|e| self.fail(e, None))?;

        let session = match self.prepare(meta.as_ref(), &source).await {
            Ok(session) => session,
            Err(e) => {
                close_quietly(meta.as_ref()).await;
                return Err(self.fail(e, None));
            }
        };
        info!(
            target = %session.target,
            intermediate = %session.intermediate,
            strategy = %session.plan.strategy,
            charset = %session.charset,
            "starting load"
        );

        let outcome = self
            .execute(meta.as_ref(), &session, &source, batches)
            .await;
        let result = match outcome {
            Ok((stats, affected)) => {
                self.drop_intermediate(meta.as_ref(), &session.intermediate)
                    .await;
                let report = LoadReport {
                    target: session.target.clone(),
                    rows: stats.rows_written,
                    strategy: session.plan.strategy,
                    commit_rows_affected: affected,
                    charset: session.charset,
                    stats,
                    elapsed: started.elapsed(),
                };
                info!(
                    target = %report.target,
                    rows = report.rows,
                    strategy = %report.strategy,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "load complete"
                );
                Ok(report)
            }
            Err(e) => {
                let left = self.cleanup_after_failure(meta.as_ref(), &session).await;
                Err(self.fail(e, left))
            }
        };
        close_quietly(meta.as_ref()).await;
        result
    }

    /// Resolve identifiers, schemas and the commit plan. Nothing is written.
    pub async fn prepare(&self, conn: &dyn Connection, source: &SourceSchema) -> Result<LoadSession> {
        if source.is_empty() {
            return Err(Error::schema_mismatch("source schema has no columns"));
        }
        for column in &source.columns {
            validate_sql_identifier(&column.name)?;
        }

        let current = self.dialect.current_schema(conn).await?;
        let target = self
            .dialect
            .canonical_table_id(&self.config.target_table(), current.as_deref());
        let charset = self.dialect.resolve_charset(conn).await?;

        let target_schema = self.introspector.describe_if_exists(conn, &target).await?;
        if let Some(existing) = &target_schema {
            self.introspector.validate_target(source, existing)?;
        }

        let intermediate = intermediate_table_id(
            &target,
            self.config.temp_database.as_deref(),
            self.dialect.max_table_name_length(),
        );
        let intermediate_schema = self
            .introspector
            .intermediate_schema(source, target_schema.as_ref())?;

        let columns: Vec<String> = intermediate_schema
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let merge = MergeConfig::from_load_config(&self.config);
        let plan = self.planner.plan(
            &target,
            &intermediate,
            &columns,
            merge.as_ref(),
            target_schema.as_ref(),
        )?;

        Ok(LoadSession {
            target,
            intermediate,
            target_schema,
            intermediate_schema,
            merge,
            plan,
            charset,
            retry: RetryPolicy::from(&self.config.retry),
        })
    }

    /// Stage, insert and commit. Returns insert statistics and rows affected by the commit.
    async fn execute<S>(
        &self,
        meta: &dyn Connection,
        session: &LoadSession,
        source: &SourceSchema,
        batches: S,
    ) -> Result<(InsertStats, u64)>
    where
        S: Stream<Item = RecordBatch>,
    {
        // a table renamed over the target keeps the target's keys and constraints
        let template = (session.plan.strategy == CommitStrategy::RenameSwap
            && session.target_exists())
        .then_some(&session.target);
        if !self.dialect.table_exists(meta, &session.intermediate).await? {
            let sql = self.dialect.create_staging_sql(
                &session.intermediate,
                &session.intermediate_schema,
                template,
            )?;
            meta.execute(&sql, &[]).await?;
        }
        let staged = self.introspector.describe(meta, &session.intermediate).await?;
        let columns = match template {
            Some(_) => self.introspector.insert_columns(source, &staged)?,
            None => {
                self.introspector.validate_shape(source, &staged)?;
                staged.columns
            }
        };

        let bulk = self.connector.open(ConnectionMode::BulkWrite).await?;
        let outcome = self
            .write_and_commit(meta, bulk.as_ref(), session, source, columns, batches)
            .await;
        close_quietly(bulk.as_ref()).await;
        outcome
    }

    async fn write_and_commit<S>(
        &self,
        meta: &dyn Connection,
        bulk: &dyn Connection,
        session: &LoadSession,
        source: &SourceSchema,
        columns: Vec<ColumnDescriptor>,
        batches: S,
    ) -> Result<(InsertStats, u64)>
    where
        S: Stream<Item = RecordBatch>,
    {
        let mut inserter = BatchInserter::new(
            bulk,
            self.dialect.clone(),
            session.intermediate.clone(),
            columns,
            &self.config.batch,
            session.retry.clone(),
        )
        .with_charset(session.charset);

        let mut batches = std::pin::pin!(batches);
        while let Some(batch) = batches.next().await {
            // a bad row rejects the whole batch before any of it is buffered
            for row in batch.rows() {
                validate_row(source, row)?;
            }
            for row in batch.into_rows() {
                inserter.accept(row).await?;
            }
        }
        let stats = inserter.close().await?;

        if session.plan.requires_target && !session.target_exists() {
            let keys = session
                .merge
                .as_ref()
                .map(|m| m.keys.clone())
                .unwrap_or_default();
            let schema = self.introspector.derive_schema(source, &keys);
            if self
                .dialect
                .create_table_if_not_exists(meta, &session.target, &schema)
                .await?
            {
                info!(target = %session.target, "created target table");
            }
        }

        let affected = if self.config.retry.retry_commit {
            self.planner
                .commit_with_retry(bulk, &session.plan, &session.retry)
                .await?
        } else {
            self.planner.commit(bulk, &session.plan).await?
        };
        self.planner.run_post_commit(bulk, &session.plan).await;
        Ok((stats, affected))
    }

    /// Drop or keep the intermediate table after a failure. Returns the
    /// table when it was left behind.
    async fn cleanup_after_failure(
        &self,
        conn: &dyn Connection,
        session: &LoadSession,
    ) -> Option<TableId> {
        if self.config.preserve_intermediate_table {
            warn!(
                intermediate = %session.intermediate,
                "keeping intermediate table after failure"
            );
            return self
                .dialect
                .table_exists(conn, &session.intermediate)
                .await
                .unwrap_or(true)
                .then(|| session.intermediate.clone());
        }
        if self.drop_intermediate(conn, &session.intermediate).await {
            None
        } else {
            Some(session.intermediate.clone())
        }
    }

    /// Best-effort drop; returns whether the table is gone
    async fn drop_intermediate(&self, conn: &dyn Connection, table: &TableId) -> bool {
        match self.dialect.drop_table_if_exists(conn, table).await {
            Ok(_) => true,
            Err(e) => {
                let cleanup = Error::Cleanup {
                    table: table.qualified_name(),
                    message: e.to_string(),
                };
                warn!(error = %cleanup, "failed to drop intermediate table");
                false
            }
        }
    }

    fn fail(&self, error: Error, intermediate: Option<TableId>) -> LoadFailure {
        let failure = LoadFailure::new(error, intermediate);
        error!(
            table = %self.config.table,
            kind = %failure.kind,
            left_intermediate_table = failure.left_intermediate_table(),
            error = %failure.message,
            "load failed"
        );
        failure
    }
}

/// Session-unique intermediate table next to `target` (or in `temp_schema`).
/// The target part is truncated so the name fits `max_len`.
pub fn intermediate_table_id(
    target: &TableId,
    temp_schema: Option<&str>,
    max_len: Option<usize>,
) -> TableId {
    let tag = Uuid::new_v4().simple().to_string();
    let suffix = format!(
        "_{}{}",
        &tag[..SESSION_TAG_LEN],
        INTERMEDIATE_SUFFIX
    );
    let mut stem = target.name.clone();
    if let Some(max) = max_len {
        let keep = max.saturating_sub(suffix.len()).max(1);
        if stem.len() > keep {
            let mut cut = keep;
            while !stem.is_char_boundary(cut) {
                cut -= 1;
            }
            stem.truncate(cut);
        }
    }

    let mut id = target.sibling(format!("{}{}", stem, suffix));
    if let Some(schema) = temp_schema {
        id.schema = Some(schema.to_string());
    }
    id
}

async fn close_quietly(conn: &dyn Connection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "failed to close connection");
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
