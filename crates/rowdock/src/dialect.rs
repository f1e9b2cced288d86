//! Dialect adapters for rowdock
//!
//! A [`DialectAdapter`] holds everything that differs between database
//! families while the load protocol stays the same:
//! - type-name translation for generated DDL
//! - identifier quoting, search path and current-schema rules
//! - catalog queries (existence, column listing) and idempotent DDL
//! - multi-row insert generation plus vendor hints
//! - merge and swap statement generation
//! - charset resolution and retryable-error classification
//!
//! MySQL SQL is built with sea-query; Oracle and SQLite are written by hand
//! (sea-query has no Oracle backend, and SQLite's upsert form needs the
//! `WHERE true` disambiguation).

use async_trait::async_trait;
use sea_query::{
    Alias, DynIden, Expr, IntoIden, MysqlQueryBuilder, OnConflict, Query, SimpleExpr, TableRef,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::{Connection, DatabaseType};
use crate::error::{DriverCode, Error, ErrorClass, Result};
use crate::merge::{MergeSpec, UpdateSource};
use crate::security::{escape_string_literal, validate_sql_identifier, validate_sql_type_name};
use crate::types::{Charset, ColumnDescriptor, LogicalType, TableId, TableSchema, Value};

/// Statements that replace the target's contents with the staged rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapStatements {
    /// Executed in order inside the commit transaction
    pub statements: Vec<String>,
    /// Best-effort statements run after a successful commit
    pub post_commit: Vec<String>,
    /// Whether the target must exist before the statements run
    pub requires_target: bool,
}

/// What a dialect's single-statement upsert matches existing rows on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpsertMatch {
    /// The merge keys themselves (`MERGE ... ON`)
    MergeKeys,
    /// A unique key consisting of exactly the merge keys (`ON CONFLICT (keys)`)
    UniqueKeyOnMergeKeys,
    /// Any unique key of the target (`ON DUPLICATE KEY UPDATE`)
    AnyUniqueKey,
}

/// Database-family policy used by the load protocol
#[async_trait]
pub trait DialectAdapter: Send + Sync + std::fmt::Debug {
    /// Dialect name
    fn name(&self) -> &'static str;

    /// Database family
    fn database_type(&self) -> DatabaseType;

    /// Map a portable column type to the dialect's DDL type token
    fn convert_type_name(&self, logical: &LogicalType) -> String;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Quote a (canonical) table identifier
    fn quote_table(&self, table: &TableId) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    /// Placeholder for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String;

    /// Longest table name the dialect accepts
    fn max_table_name_length(&self) -> Option<usize>;

    /// Largest number of bind parameters in one statement
    fn max_bind_parameters(&self) -> usize;

    /// Transport options applied to every connection before caller overrides
    fn transport_defaults(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Fill in omitted identifier components so that identifiers naming the
    /// same physical table compare equal
    fn canonical_table_id(&self, table: &TableId, current_schema: Option<&str>) -> TableId;

    /// Make `schema` the session's default namespace (no-op by default)
    async fn set_search_path(&self, _conn: &dyn Connection, _schema: &str) -> Result<()> {
        Ok(())
    }

    /// Current schema/database of the session
    async fn current_schema(&self, conn: &dyn Connection) -> Result<Option<String>>;

    /// Resolve the server-side character set (UTF-8 unless overridden)
    async fn resolve_charset(&self, _conn: &dyn Connection) -> Result<Charset> {
        Ok(Charset::Utf8)
    }

    /// Classify a driver error code (fatal unless overridden)
    fn classify_error(&self, _code: &DriverCode) -> ErrorClass {
        ErrorClass::Fatal
    }

    /// Catalog query returning a single count for `table`
    fn table_exists_sql(&self, table: &TableId) -> String;

    /// Catalog query returning `column_name`, `data_type`, `nullable` (0/1)
    /// and `ordinal_position` for `table`, ordered by declaration
    fn list_columns_sql(&self, table: &TableId) -> String;

    /// Catalog query returning `key_name` and `column_name` for each column
    /// of each unique key of `table`, primary key included. `None` when the
    /// planner has no use for unique keys.
    fn unique_keys_sql(&self, _table: &TableId) -> Option<String> {
        None
    }

    /// CREATE TABLE statement for `schema`
    fn create_table_sql(&self, table: &TableId, schema: &TableSchema) -> Result<String> {
        validate_table(table)?;
        if schema.is_empty() {
            return Err(Error::schema_mismatch(format!(
                "cannot create {} without columns",
                table
            )));
        }
        let mut defs = Vec::with_capacity(schema.len() + 1);
        for col in &schema.columns {
            validate_sql_identifier(&col.name)?;
            validate_sql_type_name(&col.type_name)?;
            let null = if col.nullable { "" } else { " NOT NULL" };
            defs.push(format!(
                "{} {}{}",
                self.quote_identifier(&col.name),
                col.type_name,
                null
            ));
        }
        if !schema.primary_key.is_empty() {
            defs.push(format!(
                "PRIMARY KEY ({})",
                self.quote_list(&str_refs(&schema.primary_key))?
            ));
        }
        Ok(format!(
            "CREATE TABLE {} ({})",
            self.quote_table(table),
            defs.join(", ")
        ))
    }

    /// CREATE TABLE statement for an intermediate table. `template` is the
    /// target when the intermediate table will be renamed into its place;
    /// the default ignores it.
    fn create_staging_sql(
        &self,
        staging: &TableId,
        schema: &TableSchema,
        _template: Option<&TableId>,
    ) -> Result<String> {
        self.create_table_sql(staging, schema)
    }

    /// DROP TABLE statement
    fn drop_table_sql(&self, table: &TableId) -> Result<String> {
        validate_table(table)?;
        Ok(format!("DROP TABLE {}", self.quote_table(table)))
    }

    /// Whether `table` exists
    async fn table_exists(&self, conn: &dyn Connection, table: &TableId) -> Result<bool> {
        validate_table(table)?;
        let row = conn.query_one(&self.table_exists_sql(table), &[]).await?;
        Ok(row
            .and_then(|r| r.get(0).and_then(Value::as_i64))
            .unwrap_or(0)
            > 0)
    }

    /// Create `table`
    async fn create_table(
        &self,
        conn: &dyn Connection,
        table: &TableId,
        schema: &TableSchema,
    ) -> Result<()> {
        let sql = self.create_table_sql(table, schema)?;
        conn.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Drop `table`
    async fn drop_table(&self, conn: &dyn Connection, table: &TableId) -> Result<()> {
        let sql = self.drop_table_sql(table)?;
        conn.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Create a table if it doesn't exist; returns whether it was created
    async fn create_table_if_not_exists(
        &self,
        conn: &dyn Connection,
        table: &TableId,
        schema: &TableSchema,
    ) -> Result<bool> {
        if self.table_exists(conn, table).await? {
            return Ok(false);
        }
        self.create_table(conn, table, schema).await?;
        Ok(true)
    }

    /// Drop a table if it exists; returns whether it was dropped
    async fn drop_table_if_exists(&self, conn: &dyn Connection, table: &TableId) -> Result<bool> {
        if !self.table_exists(conn, table).await? {
            return Ok(false);
        }
        self.drop_table(conn, table).await?;
        Ok(true)
    }

    /// Parameterized multi-row insert for `rows` rows, after [`Self::decorate_insert`]
    fn build_insert_sql(
        &self,
        table: &TableId,
        columns: &[ColumnDescriptor],
        rows: usize,
    ) -> Result<String> {
        validate_table(table)?;
        check_insert_shape(columns, rows)?;
        let cols = self.quote_list(&column_names(columns))?;
        let width = columns.len();
        let tuples: Vec<String> = (0..rows)
            .map(|r| {
                let params: Vec<String> = (1..=width)
                    .map(|c| self.placeholder(r * width + c))
                    .collect();
                format!("({})", params.join(", "))
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote_table(table),
            cols,
            tuples.join(", ")
        );
        Ok(self.decorate_insert(sql))
    }

    /// Post-process a generated insert (vendor hints); identity by default
    fn decorate_insert(&self, sql: String) -> String {
        sql
    }

    /// `INSERT INTO target (cols) SELECT cols FROM staging`
    fn insert_select_sql(
        &self,
        target: &TableId,
        staging: &TableId,
        columns: &[String],
    ) -> Result<String> {
        let cols = self.quote_list(&str_refs(columns))?;
        Ok(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.quote_table(target),
            cols,
            cols,
            self.quote_table(staging)
        ))
    }

    /// Statements that make the staged rows the target's contents.
    ///
    /// The default deletes the target's rows and copies the staged rows in,
    /// which is atomic inside the commit transaction.
    fn swap_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        columns: &[String],
        _target_exists: bool,
    ) -> Result<SwapStatements> {
        validate_table(target)?;
        Ok(SwapStatements {
            statements: vec![
                format!("DELETE FROM {}", self.quote_table(target)),
                self.insert_select_sql(target, staging, columns)?,
            ],
            post_commit: Vec::new(),
            requires_target: true,
        })
    }

    /// What [`Self::merge_statements`] matches existing rows on
    fn upsert_match(&self) -> UpsertMatch;

    /// Statements that upsert the staged rows into the target
    fn merge_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        spec: &MergeSpec,
    ) -> Result<Vec<String>>;

    /// Merge that matches rows on the merge keys alone, for targets without
    /// a unique key on them: update matched rows, then insert the staged
    /// rows that matched nothing.
    ///
    /// Staged values only; expressions need the upsert's context.
    fn keyed_merge_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        spec: &MergeSpec,
    ) -> Result<Vec<String>> {
        validate_table(target)?;
        validate_table(staging)?;
        let matched = key_match(self, target, staging, &spec.keys)?;
        let source = self.quote_identifier(&staging.name);

        let mut statements = Vec::with_capacity(2);
        if !spec.updates.is_empty() {
            let mut sets = Vec::with_capacity(spec.updates.len());
            for column in staged_updates(spec)? {
                let c = self.quote_identifier(column);
                sets.push(format!(
                    "{} = (SELECT {}.{} FROM {} WHERE {})",
                    c,
                    source,
                    c,
                    self.quote_table(staging),
                    matched
                ));
            }
            statements.push(format!(
                "UPDATE {} SET {} WHERE EXISTS (SELECT 1 FROM {} WHERE {})",
                self.quote_table(target),
                sets.join(", "),
                self.quote_table(staging),
                matched
            ));
        }
        statements.push(insert_unmatched_sql(self, target, staging, spec, &matched)?);
        Ok(statements)
    }

    /// Validate and quote a comma-separated column list
    fn quote_list(&self, names: &[&str]) -> Result<String> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            validate_sql_identifier(name)?;
            out.push(self.quote_identifier(name));
        }
        Ok(out.join(", "))
    }
}

fn str_refs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

fn column_names(columns: &[ColumnDescriptor]) -> Vec<&str> {
    columns.iter().map(|c| c.name.as_str()).collect()
}

fn validate_table(table: &TableId) -> Result<()> {
    if let Some(schema) = &table.schema {
        validate_sql_identifier(schema)?;
    }
    validate_sql_identifier(&table.name)
}

fn check_insert_shape(columns: &[ColumnDescriptor], rows: usize) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::schema_mismatch("insert without columns"));
    }
    if rows == 0 {
        return Err(Error::invalid_state("insert without rows"));
    }
    Ok(())
}

/// `staging.k = target.k AND ...`, qualified by bare table names (an
/// intermediate table never shares its target's name)
fn key_match<D: DialectAdapter + ?Sized>(
    dialect: &D,
    target: &TableId,
    staging: &TableId,
    keys: &[String],
) -> Result<String> {
    if keys.is_empty() {
        return Err(Error::config("merge requires at least one key column"));
    }
    let t = dialect.quote_identifier(&target.name);
    let s = dialect.quote_identifier(&staging.name);
    let mut terms = Vec::with_capacity(keys.len());
    for key in keys {
        validate_sql_identifier(key)?;
        let k = dialect.quote_identifier(key);
        terms.push(format!("{}.{} = {}.{}", s, k, t, k));
    }
    Ok(terms.join(" AND "))
}

/// Updated columns of a key-match merge; expressions are rejected
fn staged_updates(spec: &MergeSpec) -> Result<Vec<&str>> {
    spec.updates
        .iter()
        .map(|update| {
            validate_sql_identifier(&update.column)?;
            match update.source {
                UpdateSource::Staged => Ok(update.column.as_str()),
                UpdateSource::Expression(_) => Err(Error::schema_mismatch(format!(
                    "merge expression for '{}' needs a unique key on ({}) in the target",
                    update.column,
                    spec.keys.join(", ")
                ))),
            }
        })
        .collect()
}

/// Insert the staged rows whose keys match no target row
fn insert_unmatched_sql<D: DialectAdapter + ?Sized>(
    dialect: &D,
    target: &TableId,
    staging: &TableId,
    spec: &MergeSpec,
    matched: &str,
) -> Result<String> {
    let cols = dialect.quote_list(&str_refs(&spec.columns))?;
    let source = dialect.quote_identifier(&staging.name);
    let staged: Vec<String> = spec
        .columns
        .iter()
        .map(|c| format!("{}.{}", source, dialect.quote_identifier(c)))
        .collect();
    Ok(format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} WHERE NOT EXISTS (SELECT 1 FROM {} WHERE {})",
        dialect.quote_table(target),
        cols,
        staged.join(", "),
        dialect.quote_table(staging),
        dialect.quote_table(target),
        matched
    ))
}

/// Name for the table displaced by an atomic rename swap
fn displaced_name(staging: &str) -> String {
    match staging.strip_suffix("_bl_tmp") {
        Some(stem) => format!("{}_bl_old", stem),
        None => format!("{}_old", staging),
    }
}

/// Adapter for a database family
pub fn dialect_for(db_type: DatabaseType) -> Arc<dyn DialectAdapter> {
    match db_type {
        DatabaseType::MySQL => Arc::new(MySqlDialect),
        DatabaseType::Oracle => Arc::new(OracleDialect),
        DatabaseType::SQLite => Arc::new(SqliteDialect),
    }
}

// ===========================================================================
// MySQL
// ===========================================================================

/// ER_LOCK_WAIT_TIMEOUT
const ER_LOCK_WAIT_TIMEOUT: i64 = 1205;
/// ER_LOCK_DEADLOCK
const ER_LOCK_DEADLOCK: i64 = 1213;

/// MySQL/MariaDB dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    fn table_ref(table: &TableId) -> TableRef {
        let name = Alias::new(table.name.as_str()).into_iden();
        match &table.schema {
            Some(s) => TableRef::SchemaTable(Alias::new(s.as_str()).into_iden(), name),
            None => TableRef::Table(name),
        }
    }

    fn idens<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<DynIden>> {
        names
            .map(|n| {
                validate_sql_identifier(n)?;
                Ok(Alias::new(n).into_iden())
            })
            .collect()
    }

    fn schema_filter(table: &TableId) -> String {
        match &table.schema {
            Some(db) => format!("table_schema = '{}'", escape_string_literal(db)),
            None => "table_schema = DATABASE()".to_string(),
        }
    }
}

#[async_trait]
impl DialectAdapter for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn convert_type_name(&self, logical: &LogicalType) -> String {
        match logical {
            LogicalType::Boolean => "BOOLEAN".to_string(),
            LogicalType::TinyInt => "TINYINT".to_string(),
            LogicalType::SmallInt => "SMALLINT".to_string(),
            LogicalType::Int => "INT".to_string(),
            LogicalType::BigInt => "BIGINT".to_string(),
            LogicalType::Float => "FLOAT".to_string(),
            LogicalType::Double => "DOUBLE".to_string(),
            LogicalType::Decimal { precision, scale } => {
                format!("DECIMAL({},{})", precision, scale)
            }
            LogicalType::String {
                max_length: Some(len),
            } if *len <= 16383 => format!("VARCHAR({})", len),
            LogicalType::String { .. } | LogicalType::Text => "LONGTEXT".to_string(),
            LogicalType::Bytes => "LONGBLOB".to_string(),
            LogicalType::Date => "DATE".to_string(),
            LogicalType::Time => "TIME(6)".to_string(),
            LogicalType::Timestamp | LogicalType::TimestampTz => "DATETIME(6)".to_string(),
            LogicalType::Uuid => "CHAR(36)".to_string(),
            LogicalType::Json => "JSON".to_string(),
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn max_table_name_length(&self) -> Option<usize> {
        Some(64)
    }

    fn max_bind_parameters(&self) -> usize {
        65_535
    }

    fn transport_defaults(&self) -> Vec<(&'static str, String)> {
        vec![
            ("rewriteBatchedStatements", "true".to_string()),
            ("useCompression", "true".to_string()),
            ("tcpKeepAlive", "true".to_string()),
        ]
    }

    fn canonical_table_id(&self, table: &TableId, current_schema: Option<&str>) -> TableId {
        // MySQL has no separate catalog level: a "catalog" is the database.
        let schema = table
            .schema
            .clone()
            .or_else(|| table.catalog.clone())
            .or_else(|| current_schema.map(str::to_string));
        TableId {
            catalog: None,
            schema,
            name: table.name.clone(),
        }
    }

    async fn set_search_path(&self, conn: &dyn Connection, schema: &str) -> Result<()> {
        validate_sql_identifier(schema)?;
        conn.execute(&format!("USE {}", self.quote_identifier(schema)), &[])
            .await?;
        Ok(())
    }

    async fn current_schema(&self, conn: &dyn Connection) -> Result<Option<String>> {
        let row = conn.query_one("SELECT DATABASE()", &[]).await?;
        Ok(row.and_then(|r| r.get(0).and_then(Value::as_string)))
    }

    fn classify_error(&self, code: &DriverCode) -> ErrorClass {
        match code.vendor_code {
            Some(ER_LOCK_DEADLOCK) | Some(ER_LOCK_WAIT_TIMEOUT) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    fn table_exists_sql(&self, table: &TableId) -> String {
        format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE {} AND table_name = '{}'",
            Self::schema_filter(table),
            escape_string_literal(&table.name)
        )
    }

    fn list_columns_sql(&self, table: &TableId) -> String {
        format!(
            "SELECT column_name AS column_name, column_type AS data_type, \
             CASE WHEN is_nullable = 'YES' THEN 1 ELSE 0 END AS nullable, \
             ordinal_position AS ordinal_position \
             FROM information_schema.columns \
             WHERE {} AND table_name = '{}' \
             ORDER BY ordinal_position",
            Self::schema_filter(table),
            escape_string_literal(&table.name)
        )
    }

    fn unique_keys_sql(&self, table: &TableId) -> Option<String> {
        Some(format!(
            "SELECT index_name AS key_name, column_name AS column_name \
             FROM information_schema.statistics \
             WHERE {} AND table_name = '{}' AND non_unique = 0 \
             ORDER BY index_name, seq_in_index",
            Self::schema_filter(table),
            escape_string_literal(&table.name)
        ))
    }

    fn create_staging_sql(
        &self,
        staging: &TableId,
        schema: &TableSchema,
        template: Option<&TableId>,
    ) -> Result<String> {
        match template {
            // keys, NOT NULL and defaults survive the rename into place
            Some(target) => {
                validate_table(staging)?;
                validate_table(target)?;
                Ok(format!(
                    "CREATE TABLE {} LIKE {}",
                    self.quote_table(staging),
                    self.quote_table(target)
                ))
            }
            None => self.create_table_sql(staging, schema),
        }
    }

    fn build_insert_sql(
        &self,
        table: &TableId,
        columns: &[ColumnDescriptor],
        rows: usize,
    ) -> Result<String> {
        validate_table(table)?;
        check_insert_shape(columns, rows)?;
        let mut stmt = Query::insert();
        stmt.into_table(Self::table_ref(table))
            .columns(Self::idens(columns.iter().map(|c| c.name.as_str()))?);
        for _ in 0..rows {
            let params: Vec<SimpleExpr> = columns.iter().map(|_| Expr::cust("?")).collect();
            stmt.values(params)
                .map_err(|e| Error::internal(format!("failed to build insert: {}", e)))?;
        }
        Ok(self.decorate_insert(stmt.to_string(MysqlQueryBuilder)))
    }

    fn swap_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        _columns: &[String],
        target_exists: bool,
    ) -> Result<SwapStatements> {
        validate_table(target)?;
        validate_table(staging)?;
        if !target_exists {
            return Ok(SwapStatements {
                statements: vec![format!(
                    "RENAME TABLE {} TO {}",
                    self.quote_table(staging),
                    self.quote_table(target)
                )],
                post_commit: Vec::new(),
                requires_target: false,
            });
        }
        let displaced = target.sibling(displaced_name(&staging.name));
        Ok(SwapStatements {
            statements: vec![format!(
                "RENAME TABLE {} TO {}, {} TO {}",
                self.quote_table(target),
                self.quote_table(&displaced),
                self.quote_table(staging),
                self.quote_table(target)
            )],
            post_commit: vec![format!("DROP TABLE {}", self.quote_table(&displaced))],
            requires_target: false,
        })
    }

    fn merge_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        spec: &MergeSpec,
    ) -> Result<Vec<String>> {
        validate_table(target)?;
        validate_table(staging)?;
        let cols = Self::idens(spec.columns.iter().map(String::as_str))?;

        // ON DUPLICATE KEY UPDATE matches on the table's unique keys; the
        // planner only picks it when those are exactly the merge keys
        let mut on_dup = OnConflict::new();
        if spec.updates.is_empty() {
            let key = spec
                .keys
                .first()
                .ok_or_else(|| Error::config("merge requires at least one key column"))?;
            validate_sql_identifier(key)?;
            on_dup.value(Alias::new(key.as_str()), Expr::col(Alias::new(key.as_str())));
        }
        for update in &spec.updates {
            validate_sql_identifier(&update.column)?;
            match &update.source {
                UpdateSource::Staged => {
                    on_dup.update_column(Alias::new(update.column.as_str()));
                }
                UpdateSource::Expression(expr) => {
                    on_dup.value(Alias::new(update.column.as_str()), Expr::cust(expr.as_str()));
                }
            }
        }

        let select = Query::select()
            .columns(cols.clone())
            .from(Self::table_ref(staging))
            .to_owned();
        let mut stmt = Query::insert();
        stmt.into_table(Self::table_ref(target))
            .columns(cols)
            .select_from(select)
            .map_err(|e| Error::internal(format!("failed to build merge: {}", e)))?
            .on_conflict(on_dup);
        Ok(vec![stmt.to_string(MysqlQueryBuilder)])
    }

    fn upsert_match(&self) -> UpsertMatch {
        UpsertMatch::AnyUniqueKey
    }

    fn keyed_merge_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        spec: &MergeSpec,
    ) -> Result<Vec<String>> {
        validate_table(target)?;
        validate_table(staging)?;
        let matched = key_match(self, target, staging, &spec.keys)?;
        let t = self.quote_identifier(&target.name);
        let s = self.quote_identifier(&staging.name);

        let mut statements = Vec::with_capacity(2);
        if !spec.updates.is_empty() {
            let sets: Vec<String> = staged_updates(spec)?
                .into_iter()
                .map(|column| {
                    let c = self.quote_identifier(column);
                    format!("{}.{} = {}.{}", t, c, s, c)
                })
                .collect();
            statements.push(format!(
                "UPDATE {} JOIN {} ON {} SET {}",
                self.quote_table(target),
                self.quote_table(staging),
                matched,
                sets.join(", ")
            ));
        }
        statements.push(insert_unmatched_sql(self, target, staging, spec, &matched)?);
        Ok(statements)
    }
}

// ===========================================================================
// Oracle
// ===========================================================================

/// Server character sets with a known standard name. Anything else is
/// treated as UTF-8.
const ORACLE_CHARSETS: &[(&str, Charset)] = &[
    ("JA16SJIS", Charset::ShiftJis),
    ("JA16SJISTILDE", Charset::ShiftJis),
    ("JA16EUC", Charset::EucJp),
    ("JA16EUCTILDE", Charset::EucJp),
    ("AL32UTF8", Charset::Utf8),
    ("UTF8", Charset::Utf8),
    ("AL16UTF16", Charset::Utf16),
];

/// Map an Oracle `NLS_CHARACTERSET` value to a charset
pub fn oracle_charset(name: &str) -> Option<Charset> {
    ORACLE_CHARSETS
        .iter()
        .find(|(oracle, _)| oracle.eq_ignore_ascii_case(name.trim()))
        .map(|(_, charset)| *charset)
}

/// ORA-00060 deadlock detected
const ORA_DEADLOCK: i64 = 60;
/// ORA-08177 can't serialize access for this transaction
const ORA_CANNOT_SERIALIZE: i64 = 8177;
/// ORA-30006 resource busy; acquire with WAIT timeout expired
const ORA_WAIT_TIMEOUT: i64 = 30006;

/// Oracle dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl OracleDialect {
    fn owner_filter(table: &TableId) -> String {
        match &table.schema {
            Some(owner) => format!("owner = '{}'", escape_string_literal(owner)),
            None => "owner = SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA')".to_string(),
        }
    }
}

#[async_trait]
impl DialectAdapter for OracleDialect {
    fn name(&self) -> &'static str {
        "Oracle"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    fn convert_type_name(&self, logical: &LogicalType) -> String {
        match logical {
            LogicalType::Boolean => "NUMBER(1,0)".to_string(),
            LogicalType::TinyInt => "NUMBER(3,0)".to_string(),
            LogicalType::SmallInt => "NUMBER(5,0)".to_string(),
            LogicalType::Int => "NUMBER(10,0)".to_string(),
            // no native 64-bit integer
            LogicalType::BigInt => "NUMBER(19,0)".to_string(),
            LogicalType::Float => "BINARY_FLOAT".to_string(),
            LogicalType::Double => "BINARY_DOUBLE".to_string(),
            LogicalType::Decimal { precision, scale } => {
                format!("NUMBER({},{})", precision, scale)
            }
            LogicalType::String {
                max_length: Some(len),
            } if *len <= 4000 => format!("VARCHAR2({} CHAR)", len),
            LogicalType::String { .. } | LogicalType::Text | LogicalType::Json => {
                "CLOB".to_string()
            }
            LogicalType::Bytes => "BLOB".to_string(),
            LogicalType::Date => "DATE".to_string(),
            LogicalType::Time => "INTERVAL DAY(0) TO SECOND(6)".to_string(),
            LogicalType::Timestamp => "TIMESTAMP".to_string(),
            LogicalType::TimestampTz => "TIMESTAMP WITH TIME ZONE".to_string(),
            LogicalType::Uuid => "CHAR(36)".to_string(),
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn max_table_name_length(&self) -> Option<usize> {
        Some(30)
    }

    fn max_bind_parameters(&self) -> usize {
        65_535
    }

    fn canonical_table_id(&self, table: &TableId, current_schema: Option<&str>) -> TableId {
        TableId {
            catalog: None,
            schema: table
                .schema
                .clone()
                .or_else(|| current_schema.map(str::to_string)),
            name: table.name.clone(),
        }
    }

    async fn current_schema(&self, conn: &dyn Connection) -> Result<Option<String>> {
        let row = conn
            .query_one("SELECT SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA') FROM DUAL", &[])
            .await?;
        match row.and_then(|r| r.get(0).and_then(Value::as_string)) {
            Some(schema) => Ok(Some(schema)),
            None => Err(Error::query("failed to resolve the current schema")),
        }
    }

    async fn resolve_charset(&self, conn: &dyn Connection) -> Result<Charset> {
        let row = conn
            .query_one(
                "SELECT value FROM nls_database_parameters WHERE parameter = 'NLS_CHARACTERSET'",
                &[],
            )
            .await?;
        let name = row.and_then(|r| r.get(0).and_then(Value::as_string));
        match name.as_deref().map(|n| (n, oracle_charset(n))) {
            Some((n, Some(charset))) => {
                debug!(server = %n, charset = %charset, "resolved server charset");
                Ok(charset)
            }
            Some((n, None)) => {
                warn!(server = %n, "unmapped server charset, falling back to UTF-8");
                Ok(Charset::Utf8)
            }
            None => Ok(Charset::Utf8),
        }
    }

    fn classify_error(&self, code: &DriverCode) -> ErrorClass {
        match code.vendor_code {
            Some(ORA_DEADLOCK) | Some(ORA_CANNOT_SERIALIZE) | Some(ORA_WAIT_TIMEOUT) => {
                ErrorClass::Retryable
            }
            _ => ErrorClass::Fatal,
        }
    }

    fn table_exists_sql(&self, table: &TableId) -> String {
        format!(
            "SELECT COUNT(*) FROM all_tables WHERE {} AND table_name = '{}'",
            Self::owner_filter(table),
            escape_string_literal(&table.name)
        )
    }

    fn list_columns_sql(&self, table: &TableId) -> String {
        format!(
            "SELECT column_name AS column_name, \
             CASE \
               WHEN data_type IN ('VARCHAR2', 'NVARCHAR2', 'CHAR', 'NCHAR') \
                 THEN data_type || '(' || char_length || ')' \
               WHEN data_type = 'RAW' THEN data_type || '(' || data_length || ')' \
               WHEN data_type = 'NUMBER' AND data_precision IS NOT NULL \
                 THEN 'NUMBER(' || data_precision || ',' || NVL(data_scale, 0) || ')' \
               ELSE data_type \
             END AS data_type, \
             CASE WHEN nullable = 'Y' THEN 1 ELSE 0 END AS nullable, \
             column_id AS ordinal_position \
             FROM all_tab_columns \
             WHERE {} AND table_name = '{}' \
             ORDER BY column_id",
            Self::owner_filter(table),
            escape_string_literal(&table.name)
        )
    }

    fn build_insert_sql(
        &self,
        table: &TableId,
        columns: &[ColumnDescriptor],
        rows: usize,
    ) -> Result<String> {
        validate_table(table)?;
        check_insert_shape(columns, rows)?;
        let cols = self.quote_list(&column_names(columns))?;
        let width = columns.len();
        let selects: Vec<String> = (0..rows)
            .map(|r| {
                let params: Vec<String> = (1..=width)
                    .map(|c| self.placeholder(r * width + c))
                    .collect();
                format!("SELECT {} FROM DUAL", params.join(", "))
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) {}",
            self.quote_table(table),
            cols,
            selects.join(" UNION ALL ")
        );
        Ok(self.decorate_insert(sql))
    }

    fn decorate_insert(&self, sql: String) -> String {
        match sql.strip_prefix("INSERT ") {
            Some(rest) => format!("INSERT /*+ APPEND */ {}", rest),
            None => sql,
        }
    }

    fn upsert_match(&self) -> UpsertMatch {
        UpsertMatch::MergeKeys
    }

    fn merge_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        spec: &MergeSpec,
    ) -> Result<Vec<String>> {
        validate_table(target)?;
        validate_table(staging)?;
        let cols = self.quote_list(&str_refs(&spec.columns))?;

        let mut on = Vec::with_capacity(spec.keys.len());
        for key in &spec.keys {
            validate_sql_identifier(key)?;
            let k = self.quote_identifier(key);
            on.push(format!("T.{} = S.{}", k, k));
        }

        let mut sets = Vec::with_capacity(spec.updates.len());
        for update in &spec.updates {
            validate_sql_identifier(&update.column)?;
            if spec
                .keys
                .iter()
                .any(|k| k.eq_ignore_ascii_case(&update.column))
            {
                return Err(Error::config(format!(
                    "Oracle cannot update merge key column '{}'",
                    update.column
                )));
            }
            let c = self.quote_identifier(&update.column);
            match &update.source {
                UpdateSource::Staged => sets.push(format!("T.{} = S.{}", c, c)),
                UpdateSource::Expression(expr) => sets.push(format!("T.{} = {}", c, expr)),
            }
        }

        let staged_values: Vec<String> = spec
            .columns
            .iter()
            .map(|c| format!("S.{}", self.quote_identifier(c)))
            .collect();

        let mut sql = format!(
            "MERGE INTO {} T USING (SELECT {} FROM {}) S ON ({})",
            self.quote_table(target),
            cols,
            self.quote_table(staging),
            on.join(" AND ")
        );
        if !sets.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", sets.join(", ")));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            cols,
            staged_values.join(", ")
        ));
        Ok(vec![sql])
    }
}

// ===========================================================================
// SQLite
// ===========================================================================

/// SQLITE_BUSY
const SQLITE_BUSY: i64 = 5;
/// SQLITE_LOCKED
const SQLITE_LOCKED: i64 = 6;

/// SQLite dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn schema_of(table: &TableId) -> &str {
        table.schema.as_deref().unwrap_or("main")
    }
}

#[async_trait]
impl DialectAdapter for SqliteDialect {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn convert_type_name(&self, logical: &LogicalType) -> String {
        match logical {
            LogicalType::Boolean => "BOOLEAN".to_string(),
            LogicalType::TinyInt | LogicalType::SmallInt => "SMALLINT".to_string(),
            LogicalType::Int => "INTEGER".to_string(),
            LogicalType::BigInt => "BIGINT".to_string(),
            LogicalType::Float => "REAL".to_string(),
            LogicalType::Double => "DOUBLE".to_string(),
            LogicalType::Decimal { precision, scale } => {
                format!("DECIMAL({},{})", precision, scale)
            }
            LogicalType::String {
                max_length: Some(len),
            } => format!("VARCHAR({})", len),
            LogicalType::String { max_length: None }
            | LogicalType::Text
            | LogicalType::Uuid
            | LogicalType::Json => "TEXT".to_string(),
            LogicalType::Bytes => "BLOB".to_string(),
            LogicalType::Date => "DATE".to_string(),
            LogicalType::Time => "TIME".to_string(),
            LogicalType::Timestamp | LogicalType::TimestampTz => "TIMESTAMP".to_string(),
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn max_table_name_length(&self) -> Option<usize> {
        None
    }

    fn max_bind_parameters(&self) -> usize {
        32_766
    }

    fn canonical_table_id(&self, table: &TableId, current_schema: Option<&str>) -> TableId {
        TableId {
            catalog: None,
            schema: Some(
                table
                    .schema
                    .clone()
                    .or_else(|| current_schema.map(str::to_string))
                    .unwrap_or_else(|| "main".to_string()),
            ),
            name: table.name.clone(),
        }
    }

    async fn current_schema(&self, _conn: &dyn Connection) -> Result<Option<String>> {
        Ok(Some("main".to_string()))
    }

    async fn resolve_charset(&self, conn: &dyn Connection) -> Result<Charset> {
        let row = conn.query_one("PRAGMA encoding", &[]).await?;
        let encoding = row.and_then(|r| r.get(0).and_then(Value::as_string));
        Ok(match encoding {
            Some(e) if e.to_ascii_uppercase().starts_with("UTF-16") => Charset::Utf16,
            _ => Charset::Utf8,
        })
    }

    fn classify_error(&self, code: &DriverCode) -> ErrorClass {
        // extended result codes carry the primary code in the low byte
        match code.vendor_code.map(|c| c & 0xff) {
            Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    fn table_exists_sql(&self, table: &TableId) -> String {
        format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = '{}'",
            self.quote_identifier(Self::schema_of(table)),
            escape_string_literal(&table.name)
        )
    }

    fn list_columns_sql(&self, table: &TableId) -> String {
        format!(
            "SELECT name AS column_name, type AS data_type, \
             CASE WHEN \"notnull\" = 0 THEN 1 ELSE 0 END AS nullable, \
             cid + 1 AS ordinal_position \
             FROM pragma_table_info('{}', '{}') \
             ORDER BY cid",
            escape_string_literal(&table.name),
            escape_string_literal(Self::schema_of(table))
        )
    }

    fn unique_keys_sql(&self, table: &TableId) -> Option<String> {
        let name = escape_string_literal(&table.name);
        let schema = escape_string_literal(Self::schema_of(table));
        // an INTEGER PRIMARY KEY aliases the rowid and has no index entry
        Some(format!(
            "SELECT '' AS key_name, name AS column_name \
             FROM pragma_table_info('{}', '{}') WHERE pk > 0 \
             UNION ALL \
             SELECT il.name AS key_name, ii.name AS column_name \
             FROM pragma_index_list('{}', '{}') AS il \
             JOIN pragma_index_info(il.name, '{}') AS ii \
             WHERE il.\"unique\" = 1 AND il.partial = 0",
            name, schema, name, schema, schema
        ))
    }

    fn upsert_match(&self) -> UpsertMatch {
        UpsertMatch::UniqueKeyOnMergeKeys
    }

    fn merge_statements(
        &self,
        target: &TableId,
        staging: &TableId,
        spec: &MergeSpec,
    ) -> Result<Vec<String>> {
        validate_table(target)?;
        let insert = self.insert_select_sql(target, staging, &spec.columns)?;
        let keys = self.quote_list(&str_refs(&spec.keys))?;

        let action = if spec.updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let mut sets = Vec::with_capacity(spec.updates.len());
            for update in &spec.updates {
                validate_sql_identifier(&update.column)?;
                let c = self.quote_identifier(&update.column);
                match &update.source {
                    UpdateSource::Staged => sets.push(format!("{} = excluded.{}", c, c)),
                    UpdateSource::Expression(expr) => sets.push(format!("{} = {}", c, expr)),
                }
            }
            format!("DO UPDATE SET {}", sets.join(", "))
        };

        // `WHERE true` keeps the parser from reading ON CONFLICT as a join clause
        Ok(vec![format!(
            "{} WHERE true ON CONFLICT ({}) {}",
            insert, keys, action
        )])
    }
}
