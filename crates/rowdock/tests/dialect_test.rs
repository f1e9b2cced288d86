//! Dialect adapter tests against a scripted connection

use async_trait::async_trait;
use rowdock::dialect::oracle_charset;
use rowdock::prelude::*;
use std::sync::Mutex;

/// Answers queries from a fixed script and records executed statements
#[derive(Default)]
struct ScriptedConnection {
    answers: Vec<(&'static str, Vec<Value>)>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedConnection {
    fn answering(fragment: &'static str, values: Vec<Value>) -> Self {
        Self {
            answers: vec![(fragment, values)],
            ..Default::default()
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(self
            .answers
            .iter()
            .filter(|(fragment, _)| sql.contains(fragment))
            .map(|(_, values)| {
                let columns = (0..values.len()).map(|i| format!("c{}", i)).collect();
                Row::new(columns, values.clone())
            })
            .collect())
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(0)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Err(Error::unsupported("scripted connection has no transactions"))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ==================== Charset Tests ====================

#[test]
fn test_oracle_charset_names() {
    assert_eq!(oracle_charset("JA16SJIS"), Some(Charset::ShiftJis));
    assert_eq!(oracle_charset("ja16euctilde"), Some(Charset::EucJp));
    assert_eq!(oracle_charset(" AL32UTF8 "), Some(Charset::Utf8));
    assert_eq!(oracle_charset("AL16UTF16"), Some(Charset::Utf16));
    assert_eq!(oracle_charset("WE8ISO8859P1"), None);
}

#[tokio::test]
async fn test_oracle_resolves_server_charset() {
    let conn = ScriptedConnection::answering("NLS_CHARACTERSET", vec!["JA16SJISTILDE".into()]);
    let charset = OracleDialect.resolve_charset(&conn).await.unwrap();
    assert_eq!(charset, Charset::ShiftJis);
}

#[tokio::test]
async fn test_oracle_unmapped_charset_falls_back_to_utf8() {
    let conn = ScriptedConnection::answering("NLS_CHARACTERSET", vec!["WE8MSWIN1252".into()]);
    assert_eq!(
        OracleDialect.resolve_charset(&conn).await.unwrap(),
        Charset::Utf8
    );

    let empty = ScriptedConnection::default();
    assert_eq!(
        OracleDialect.resolve_charset(&empty).await.unwrap(),
        Charset::Utf8
    );
}

#[tokio::test]
async fn test_mysql_charset_is_utf8() {
    let conn = ScriptedConnection::default();
    assert_eq!(MySqlDialect.resolve_charset(&conn).await.unwrap(), Charset::Utf8);
}

// ==================== Current Schema Tests ====================

#[tokio::test]
async fn test_oracle_current_schema() {
    let conn = ScriptedConnection::answering("CURRENT_SCHEMA", vec!["LOADER".into()]);
    assert_eq!(
        OracleDialect.current_schema(&conn).await.unwrap(),
        Some("LOADER".to_string())
    );
}

#[tokio::test]
async fn test_oracle_current_schema_missing_is_error() {
    let conn = ScriptedConnection::answering("CURRENT_SCHEMA", vec![Value::Null]);
    let err = OracleDialect.current_schema(&conn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(err.to_string().contains("current schema"));
}

#[tokio::test]
async fn test_mysql_current_schema_may_be_absent() {
    let conn = ScriptedConnection::answering("DATABASE()", vec![Value::Null]);
    assert_eq!(MySqlDialect.current_schema(&conn).await.unwrap(), None);
}

#[tokio::test]
async fn test_mysql_search_path_issues_use() {
    let conn = ScriptedConnection::default();
    MySqlDialect.set_search_path(&conn, "analytics").await.unwrap();
    assert_eq!(conn.executed(), vec!["USE `analytics`".to_string()]);

    assert!(MySqlDialect.set_search_path(&conn, "bad name").await.is_err());
    assert_eq!(conn.executed().len(), 1);
}

// ==================== Idempotent DDL Tests ====================

#[tokio::test]
async fn test_drop_if_exists_skips_missing_table() {
    let conn = ScriptedConnection::answering("COUNT(*)", vec![Value::Int64(0)]);
    let table = TableId::new("orders").with_schema("app");
    assert!(!MySqlDialect.drop_table_if_exists(&conn, &table).await.unwrap());
    assert!(conn.executed().is_empty());
}

#[tokio::test]
async fn test_create_if_not_exists_creates_once() {
    let table = TableId::new("orders").with_schema("app");
    let schema = TableSchema::new(vec![ColumnDescriptor::new("id", "INT", false, 1)]);

    let missing = ScriptedConnection::answering("COUNT(*)", vec![Value::Int64(0)]);
    assert!(MySqlDialect
        .create_table_if_not_exists(&missing, &table, &schema)
        .await
        .unwrap());
    assert_eq!(
        missing.executed(),
        vec!["CREATE TABLE `app`.`orders` (`id` INT NOT NULL)".to_string()]
    );

    let present = ScriptedConnection::answering("COUNT(*)", vec![Value::Int64(1)]);
    assert!(!MySqlDialect
        .create_table_if_not_exists(&present, &table, &schema)
        .await
        .unwrap());
    assert!(present.executed().is_empty());
}

// ==================== Classification Tests ====================

#[test]
fn test_retryable_codes_per_dialect() {
    let cases: [(&dyn DialectAdapter, i64, ErrorClass); 8] = [
        (&MySqlDialect, 1213, ErrorClass::Retryable),
        (&MySqlDialect, 1205, ErrorClass::Retryable),
        (&MySqlDialect, 1062, ErrorClass::Fatal),
        (&OracleDialect, 60, ErrorClass::Retryable),
        (&OracleDialect, 8177, ErrorClass::Retryable),
        (&OracleDialect, 1, ErrorClass::Fatal),
        (&SqliteDialect, 5, ErrorClass::Retryable),
        (&SqliteDialect, 2067, ErrorClass::Fatal),
    ];
    for (dialect, code, expected) in cases {
        assert_eq!(
            dialect.classify_error(&DriverCode::vendor(code)),
            expected,
            "{} code {}",
            dialect.name(),
            code
        );
    }
}

#[test]
fn test_sqlite_extended_busy_code_is_retryable() {
    // SQLITE_BUSY_SNAPSHOT
    assert_eq!(
        SqliteDialect.classify_error(&DriverCode::vendor(517)),
        ErrorClass::Retryable
    );
}

// ==================== Cross-Dialect SQL Tests ====================

#[test]
fn test_insert_placeholders_per_dialect() {
    let table = TableId::new("t").with_schema("s");
    let columns = vec![
        ColumnDescriptor::new("a", "INT", true, 1),
        ColumnDescriptor::new("b", "INT", true, 2),
    ];

    assert_eq!(
        SqliteDialect.build_insert_sql(&table, &columns, 2).unwrap(),
        "INSERT INTO \"s\".\"t\" (\"a\", \"b\") VALUES (?, ?), (?, ?)"
    );
    assert_eq!(
        OracleDialect.build_insert_sql(&table, &columns, 2).unwrap(),
        "INSERT /*+ APPEND */ INTO \"s\".\"t\" (\"a\", \"b\") \
         SELECT :1, :2 FROM DUAL UNION ALL SELECT :3, :4 FROM DUAL"
    );
}

#[test]
fn test_type_names_per_dialect() {
    let varchar = LogicalType::String {
        max_length: Some(40),
    };
    assert_eq!(MySqlDialect.convert_type_name(&varchar), "VARCHAR(40)");
    assert_eq!(OracleDialect.convert_type_name(&varchar), "VARCHAR2(40 CHAR)");
    assert_eq!(SqliteDialect.convert_type_name(&varchar), "VARCHAR(40)");

    assert_eq!(MySqlDialect.convert_type_name(&LogicalType::BigInt), "BIGINT");
    assert_eq!(OracleDialect.convert_type_name(&LogicalType::BigInt), "NUMBER(19,0)");
    assert_eq!(OracleDialect.convert_type_name(&LogicalType::Text), "CLOB");
}

#[test]
fn test_table_name_limits() {
    assert_eq!(OracleDialect.max_table_name_length(), Some(30));
    assert_eq!(MySqlDialect.max_table_name_length(), Some(64));
    assert_eq!(SqliteDialect.max_table_name_length(), None);
}

#[test]
fn test_canonical_ids_compare_equal() {
    let bare = TableId::new("orders");
    let qualified = TableId::new("orders").with_schema("shop");

    for dialect in [dialect_for(DatabaseType::MySQL), dialect_for(DatabaseType::Oracle)] {
        assert_eq!(
            dialect.canonical_table_id(&bare, Some("shop")),
            dialect.canonical_table_id(&qualified, Some("other")),
            "{}",
            dialect.name()
        );
    }
}

#[test]
fn test_identifier_injection_rejected() {
    let bad = TableId::new("t; DROP TABLE x");
    let columns = vec![ColumnDescriptor::new("a", "INT", true, 1)];
    for dialect in [
        dialect_for(DatabaseType::MySQL),
        dialect_for(DatabaseType::Oracle),
        dialect_for(DatabaseType::SQLite),
    ] {
        assert!(
            dialect.build_insert_sql(&bad, &columns, 1).is_err(),
            "{}",
            dialect.name()
        );
    }
}

// ==================== Staging DDL Tests ====================

#[test]
fn test_mysql_rename_staging_copies_target_definition() {
    let target = TableId::new("orders").with_schema("app");
    let staging = TableId::new("orders_0a1b2c3d4e5f_bl_tmp").with_schema("app");
    let schema = TableSchema::new(vec![ColumnDescriptor::new("id", "INT", true, 1)]);

    assert_eq!(
        MySqlDialect
            .create_staging_sql(&staging, &schema, Some(&target))
            .unwrap(),
        "CREATE TABLE `app`.`orders_0a1b2c3d4e5f_bl_tmp` LIKE `app`.`orders`"
    );
    assert_eq!(
        MySqlDialect.create_staging_sql(&staging, &schema, None).unwrap(),
        "CREATE TABLE `app`.`orders_0a1b2c3d4e5f_bl_tmp` (`id` INT)"
    );
    assert!(MySqlDialect
        .create_staging_sql(&staging, &schema, Some(&TableId::new("bad name")))
        .is_err());
}

#[test]
fn test_sqlite_staging_ignores_template() {
    let target = TableId::new("orders").with_schema("main");
    let staging = TableId::new("orders_tmp").with_schema("main");
    let schema = TableSchema::new(vec![ColumnDescriptor::new("id", "INT", true, 1)]);
    assert_eq!(
        SqliteDialect
            .create_staging_sql(&staging, &schema, Some(&target))
            .unwrap(),
        "CREATE TABLE \"main\".\"orders_tmp\" (\"id\" INT)"
    );
}

// ==================== Keyed Merge Tests ====================

fn keyed_spec(updates: Vec<ColumnUpdate>) -> MergeSpec {
    MergeSpec {
        keys: vec!["id".into()],
        columns: vec!["id".into(), "score".into()],
        updates,
    }
}

#[test]
fn test_unique_key_catalog_queries() {
    let table = TableId::new("scores").with_schema("app");
    let mysql = MySqlDialect.unique_keys_sql(&table).unwrap();
    assert!(mysql.contains("information_schema.statistics"));
    assert!(mysql.contains("non_unique = 0"));
    let sqlite = SqliteDialect.unique_keys_sql(&table).unwrap();
    assert!(sqlite.contains("pragma_index_list('scores', 'app')"));
    assert!(OracleDialect.unique_keys_sql(&table).is_none());

    assert_eq!(MySqlDialect.upsert_match(), UpsertMatch::AnyUniqueKey);
    assert_eq!(SqliteDialect.upsert_match(), UpsertMatch::UniqueKeyOnMergeKeys);
    assert_eq!(OracleDialect.upsert_match(), UpsertMatch::MergeKeys);
}

#[test]
fn test_sqlite_keyed_merge_sql() {
    let target = TableId::new("scores").with_schema("main");
    let staging = TableId::new("scores_tmp").with_schema("main");
    let statements = SqliteDialect
        .keyed_merge_statements(&target, &staging, &keyed_spec(vec![ColumnUpdate::staged("score")]))
        .unwrap();
    assert_eq!(
        statements,
        vec![
            "UPDATE \"main\".\"scores\" SET \"score\" = (SELECT \"scores_tmp\".\"score\" \
             FROM \"main\".\"scores_tmp\" WHERE \"scores_tmp\".\"id\" = \"scores\".\"id\") \
             WHERE EXISTS (SELECT 1 FROM \"main\".\"scores_tmp\" \
             WHERE \"scores_tmp\".\"id\" = \"scores\".\"id\")"
                .to_string(),
            "INSERT INTO \"main\".\"scores\" (\"id\", \"score\") \
             SELECT \"scores_tmp\".\"id\", \"scores_tmp\".\"score\" FROM \"main\".\"scores_tmp\" \
             WHERE NOT EXISTS (SELECT 1 FROM \"main\".\"scores\" \
             WHERE \"scores_tmp\".\"id\" = \"scores\".\"id\")"
                .to_string(),
        ]
    );
}

#[test]
fn test_mysql_keyed_merge_sql() {
    let target = TableId::new("scores").with_schema("app");
    let staging = TableId::new("scores_tmp").with_schema("app");
    let statements = MySqlDialect
        .keyed_merge_statements(&target, &staging, &keyed_spec(vec![ColumnUpdate::staged("score")]))
        .unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(
        statements[0],
        "UPDATE `app`.`scores` JOIN `app`.`scores_tmp` ON `scores_tmp`.`id` = `scores`.`id` \
         SET `scores`.`score` = `scores_tmp`.`score`"
    );
    assert!(statements[1].starts_with("INSERT INTO `app`.`scores` (`id`, `score`) SELECT"));

    // keep-existing only inserts new keys
    let insert_only = MySqlDialect
        .keyed_merge_statements(&target, &staging, &keyed_spec(Vec::new()))
        .unwrap();
    assert_eq!(insert_only.len(), 1);
    assert!(insert_only[0].contains("WHERE NOT EXISTS"));

    let err = MySqlDialect
        .keyed_merge_statements(
            &target,
            &staging,
            &keyed_spec(vec![ColumnUpdate::expression("score", "score + 1")]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
}
