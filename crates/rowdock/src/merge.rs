//! Merge planner
//!
//! Chooses how staged rows reach the target:
//! - **merge**: keyed upsert, when merge keys are configured; targets
//!   without a unique key on the merge keys get an update-then-insert pair
//! - **swap**: the staged rows replace the target's contents, by atomic
//!   rename where the dialect has one and by delete-then-insert otherwise
//!
//! Every commit attempt runs inside one transaction and is rolled back in
//! full on failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::LoadConfig;
use crate::connection::{Connection, Transaction};
use crate::dialect::{DialectAdapter, UpsertMatch};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::{TableId, TableSchema};

/// Value-overwrite rule for rows whose key already exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Overwrite value columns with the staged values
    #[default]
    Replace,
    /// Leave existing rows untouched
    KeepExisting,
    /// Per-column SQL expressions in the dialect's upsert context; value
    /// columns without an expression take the staged value
    Expressions(BTreeMap<String, String>),
}

/// Merge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    /// Key columns (non-empty)
    pub keys: Vec<String>,
    /// Columns to overwrite on conflict; `None` means every non-key column
    pub columns: Option<Vec<String>>,
    /// Overwrite rule
    pub rule: MergeRule,
}

impl MergeConfig {
    /// Merge on `keys` with the replace rule
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            columns: None,
            rule: MergeRule::Replace,
        }
    }

    /// Restrict the overwritten columns
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Set the overwrite rule
    pub fn with_rule(mut self, rule: MergeRule) -> Self {
        self.rule = rule;
        self
    }

    /// Merge configuration of a load, if it runs in merge mode
    pub fn from_load_config(config: &LoadConfig) -> Option<Self> {
        config.is_merge().then(|| Self {
            keys: config.merge_keys.clone(),
            columns: config.merge_columns.clone(),
            rule: config.merge_rule.clone(),
        })
    }
}

/// Where an overwritten value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    /// The staged row's value
    Staged,
    /// A raw SQL expression
    Expression(String),
}

/// One overwritten column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUpdate {
    /// Column name
    pub column: String,
    /// Value source
    pub source: UpdateSource,
}

impl ColumnUpdate {
    /// Take the staged value
    pub fn staged(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            source: UpdateSource::Staged,
        }
    }

    /// Compute the value with `expr`
    pub fn expression(column: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            source: UpdateSource::Expression(expr.into()),
        }
    }
}

/// Resolved merge, handed to the dialect for SQL generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    /// Key columns
    pub keys: Vec<String>,
    /// All inserted columns in table order
    pub columns: Vec<String>,
    /// Columns overwritten on match; empty keeps existing rows
    pub updates: Vec<ColumnUpdate>,
}

/// Commit strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStrategy {
    /// Keyed upsert
    Merge,
    /// Update matched rows, then insert unmatched ones
    UpdateInsertMerge,
    /// Atomic rename of the staging table into place
    RenameSwap,
    /// Delete target rows then copy staged rows, in one transaction
    DeleteInsertSwap,
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::UpdateInsertMerge => write!(f, "update_insert_merge"),
            Self::RenameSwap => write!(f, "rename_swap"),
            Self::DeleteInsertSwap => write!(f, "delete_insert_swap"),
        }
    }
}

/// Statements of one commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPlan {
    /// Chosen strategy
    pub strategy: CommitStrategy,
    /// Executed in order inside one transaction
    pub statements: Vec<String>,
    /// Best-effort cleanup after the transaction committed
    pub post_commit: Vec<String>,
    /// Whether re-running the plan after a rolled-back attempt yields the same result
    pub idempotent: bool,
    /// Whether the target must exist before commit
    pub requires_target: bool,
}

fn find_column<'a>(columns: &'a [String], name: &str) -> Option<&'a String> {
    columns.iter().find(|c| c.eq_ignore_ascii_case(name))
}

/// Builds and executes commit plans
#[derive(Debug, Clone)]
pub struct MergePlanner {
    dialect: Arc<dyn DialectAdapter>,
}

impl MergePlanner {
    /// Create a planner for a dialect
    pub fn new(dialect: Arc<dyn DialectAdapter>) -> Self {
        Self { dialect }
    }

    /// Resolve a merge configuration against the inserted columns
    pub fn resolve(&self, columns: &[String], merge: &MergeConfig) -> Result<MergeSpec> {
        if merge.keys.is_empty() {
            return Err(Error::config("merge requires at least one key column"));
        }
        let mut keys = Vec::with_capacity(merge.keys.len());
        for key in &merge.keys {
            let col = find_column(columns, key).ok_or_else(|| {
                Error::schema_mismatch(format!("merge key '{}' is not a column of the target", key))
            })?;
            keys.push(col.clone());
        }

        let update_columns: Vec<String> = match &merge.columns {
            Some(requested) => requested
                .iter()
                .map(|name| {
                    find_column(columns, name).cloned().ok_or_else(|| {
                        Error::schema_mismatch(format!(
                            "merge column '{}' is not a column of the target",
                            name
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            None => columns
                .iter()
                .filter(|c| find_column(&keys, c).is_none())
                .cloned()
                .collect(),
        };

        let updates = match &merge.rule {
            MergeRule::KeepExisting => Vec::new(),
            MergeRule::Replace => update_columns.into_iter().map(ColumnUpdate::staged).collect(),
            MergeRule::Expressions(exprs) => {
                for col in exprs.keys() {
                    if find_column(&update_columns, col).is_none() {
                        return Err(Error::config(format!(
                            "merge expression for '{}', which is not an updated column",
                            col
                        )));
                    }
                }
                update_columns
                    .into_iter()
                    .map(|col| {
                        match exprs.iter().find(|(name, _)| name.eq_ignore_ascii_case(&col)) {
                            Some((_, expr)) => ColumnUpdate::expression(col, expr.clone()),
                            None => ColumnUpdate::staged(col),
                        }
                    })
                    .collect()
            }
        };

        Ok(MergeSpec {
            keys,
            columns: columns.to_vec(),
            updates,
        })
    }

    /// Choose the strategy and generate its statements. `target_schema` is
    /// the live target's schema; `None` when the engine will create it.
    pub fn plan(
        &self,
        target: &TableId,
        staging: &TableId,
        columns: &[String],
        merge: Option<&MergeConfig>,
        target_schema: Option<&TableSchema>,
    ) -> Result<CommitPlan> {
        if let Some(merge) = merge.filter(|m| !m.keys.is_empty()) {
            let spec = self.resolve(columns, merge)?;
            let (strategy, statements) = if self.upsert_fits(&spec.keys, target_schema) {
                (
                    CommitStrategy::Merge,
                    self.dialect.merge_statements(target, staging, &spec)?,
                )
            } else {
                (
                    CommitStrategy::UpdateInsertMerge,
                    self.dialect.keyed_merge_statements(target, staging, &spec)?,
                )
            };
            return Ok(CommitPlan {
                strategy,
                statements,
                post_commit: Vec::new(),
                // expressions may depend on the current value (counters)
                idempotent: !matches!(merge.rule, MergeRule::Expressions(_)),
                requires_target: true,
            });
        }

        let swap = self
            .dialect
            .swap_statements(target, staging, columns, target_schema.is_some())?;
        let strategy = if swap.requires_target {
            CommitStrategy::DeleteInsertSwap
        } else {
            CommitStrategy::RenameSwap
        };
        Ok(CommitPlan {
            strategy,
            statements: swap.statements,
            post_commit: swap.post_commit,
            idempotent: strategy == CommitStrategy::DeleteInsertSwap,
            requires_target: swap.requires_target,
        })
    }

    /// Whether the dialect's upsert matches rows on exactly `keys`. A
    /// missing target is created with `keys` as its primary key.
    fn upsert_fits(&self, keys: &[String], target_schema: Option<&TableSchema>) -> bool {
        match (self.dialect.upsert_match(), target_schema) {
            (UpsertMatch::MergeKeys, _) | (_, None) => true,
            (UpsertMatch::UniqueKeyOnMergeKeys, Some(schema)) => schema.has_unique_key(keys),
            (UpsertMatch::AnyUniqueKey, Some(schema)) => schema.only_unique_key(keys),
        }
    }

    /// Execute the plan in one transaction. Returns rows affected.
    pub async fn commit(&self, conn: &dyn Connection, plan: &CommitPlan) -> Result<u64> {
        let tx = conn.begin().await.map_err(|e| commit_error(e, true))?;
        match execute_all(tx.as_ref(), &plan.statements).await {
            Ok(affected) => {
                tx.commit().await.map_err(|e| commit_error(e, false))?;
                Ok(affected)
            }
            Err(e) => {
                let rolled_back = match tx.rollback().await {
                    Ok(()) => true,
                    Err(rb) => {
                        warn!(error = %rb, "rollback after failed commit attempt failed");
                        false
                    }
                };
                Err(commit_error(e, rolled_back))
            }
        }
    }

    /// Execute the plan, retrying classified-retryable failures when the plan is idempotent
    pub async fn commit_with_retry(
        &self,
        conn: &dyn Connection,
        plan: &CommitPlan,
        policy: &RetryPolicy,
    ) -> Result<u64> {
        if !plan.idempotent {
            return self.commit(conn, plan).await;
        }
        policy
            .run(self.dialect.as_ref(), "commit", |_| self.commit(conn, plan))
            .await
            .map(|(affected, attempts)| {
                if attempts > 1 {
                    info!(attempts, strategy = %plan.strategy, "commit succeeded after retries");
                }
                affected
            })
            .map_err(|failure| failure.error)
    }

    /// Run post-commit statements; failures are logged, not returned
    pub async fn run_post_commit(&self, conn: &dyn Connection, plan: &CommitPlan) {
        for sql in &plan.post_commit {
            if let Err(e) = conn.execute(sql, &[]).await {
                warn!(sql = %sql, error = %e, "post-commit statement failed");
            }
        }
    }
}

async fn execute_all(tx: &dyn Transaction, statements: &[String]) -> Result<u64> {
    let mut affected = 0;
    for sql in statements {
        affected += tx.execute(sql, &[]).await?;
    }
    Ok(affected)
}

fn commit_error(error: Error, rolled_back: bool) -> Error {
    if let Error::Commit { .. } = error {
        return error;
    }
    Error::Commit {
        message: error.message(),
        code: error.driver_code().cloned(),
        rolled_back,
    }
}
