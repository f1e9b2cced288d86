//! Connector
//!
//! Produces connections for one load. Each connection is opened in a
//! [`ConnectionMode`] that picks its timeout profile: metadata work (catalog
//! queries, DDL) gets the shorter socket timeout, bulk writes and commits the
//! longer one.
//!
//! Transport options are layered in this order, later layers winning:
//! dialect throughput defaults, mode timeouts, caller options, `user`.
//! The password is applied last and never logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{LoadConfig, SensitiveString, TimeoutSettings};
use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::dialect::DialectAdapter;
use crate::error::{Error, ErrorKind, Result};

/// Transport option carrying the connect timeout (milliseconds)
pub const CONNECT_TIMEOUT_OPTION: &str = "connectTimeout";
/// Transport option carrying the socket read timeout (milliseconds)
pub const SOCKET_TIMEOUT_OPTION: &str = "socketTimeout";

/// Operation class of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    /// Existence checks, introspection and DDL
    Metadata,
    /// Batched inserts and the commit
    BulkWrite,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => write!(f, "metadata"),
            Self::BulkWrite => write!(f, "bulk-write"),
        }
    }
}

/// Connect and socket timeouts of one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// Connection establishment
    pub connect: Duration,
    /// Socket reads (zero disables)
    pub socket: Duration,
}

impl TimeoutProfile {
    /// Profile for `mode` from the configured settings
    pub fn for_mode(settings: &TimeoutSettings, mode: ConnectionMode) -> Self {
        let (connect, socket) = match mode {
            ConnectionMode::Metadata => (settings.metadata_connect_ms, settings.metadata_socket_ms),
            ConnectionMode::BulkWrite => (settings.bulk_connect_ms, settings.bulk_socket_ms),
        };
        Self {
            connect: Duration::from_millis(connect),
            socket: Duration::from_millis(socket),
        }
    }
}

/// Opens connections for one load
pub struct Connector {
    factory: Arc<dyn ConnectionFactory>,
    dialect: Arc<dyn DialectAdapter>,
    url: String,
    user: Option<String>,
    password: Option<SensitiveString>,
    database: Option<String>,
    options: BTreeMap<String, String>,
    timeouts: TimeoutSettings,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("dialect", &self.dialect.name())
            .field("url", &self.url)
            .field("user", &self.user)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Create a connector from a validated load configuration
    pub fn new(
        config: &LoadConfig,
        dialect: Arc<dyn DialectAdapter>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        if factory.database_type() != dialect.database_type() {
            return Err(Error::config(format!(
                "connection factory is for {}, dialect is {}",
                factory.database_type(),
                dialect.database_type()
            )));
        }
        Ok(Self {
            url: connection_url(config)?,
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            options: config.options.clone(),
            timeouts: config.timeouts.clone(),
            factory,
            dialect,
        })
    }

    /// Connection URL, without credentials
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dialect the connections are opened for
    pub fn dialect(&self) -> &Arc<dyn DialectAdapter> {
        &self.dialect
    }

    /// Effective transport options for `mode`, in layering order. The
    /// password is not part of the result.
    pub fn options_for(&self, mode: ConnectionMode) -> BTreeMap<String, String> {
        let profile = TimeoutProfile::for_mode(&self.timeouts, mode);
        let mut props: BTreeMap<String, String> = self
            .dialect
            .transport_defaults()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        props.insert(
            CONNECT_TIMEOUT_OPTION.to_string(),
            profile.connect.as_millis().to_string(),
        );
        props.insert(
            SOCKET_TIMEOUT_OPTION.to_string(),
            profile.socket.as_millis().to_string(),
        );
        props.extend(self.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(user) = &self.user {
            props.insert("user".to_string(), user.clone());
        }
        props
    }

    /// Transport configuration for `mode`, credentials included
    pub fn connection_config(&self, mode: ConnectionMode) -> Result<ConnectionConfig> {
        let mut props = self.options_for(mode);
        let connect_ms = millis_option(&props, CONNECT_TIMEOUT_OPTION)?;
        let socket_ms = millis_option(&props, SOCKET_TIMEOUT_OPTION)?;
        let user = props.remove("user");

        let mut config = ConnectionConfig::new(&self.url)
            .with_connect_timeout(connect_ms)
            .with_socket_timeout(socket_ms);
        config.properties = props;
        config.user = user;
        config.password = self.password.clone();
        Ok(config)
    }

    /// Open a connection in `mode`.
    ///
    /// Establishment failures (including the connect timeout) are reported
    /// as [`ErrorKind::ConnectionFailure`].
    pub async fn open(&self, mode: ConnectionMode) -> Result<Box<dyn Connection>> {
        let config = self.connection_config(mode)?;
        info!(
            url = %self.url,
            mode = %mode,
            user = ?config.user,
            options = ?config.properties,
            "connecting"
        );

        let connect = self.factory.connect(&config);
        let attempt = if config.connect_timeout_ms == 0 {
            Ok(connect.await)
        } else {
            let timeout = Duration::from_millis(config.connect_timeout_ms);
            tokio::time::timeout(timeout, connect).await
        };
        let conn = match attempt {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionFailure => return Err(e),
            Ok(Err(e)) => {
                return Err(Error::connection_with_source(
                    format!("failed to connect to {}", self.url),
                    e,
                ))
            }
            Err(_) => {
                return Err(Error::connection(format!(
                    "timed out connecting to {} after {}ms",
                    self.url, config.connect_timeout_ms
                )))
            }
        };

        if let Some(database) = &self.database {
            if let Err(e) = self.dialect.set_search_path(conn.as_ref(), database).await {
                if let Err(close) = conn.close().await {
                    warn!(error = %close, "failed to close connection");
                }
                return Err(e);
            }
        }
        Ok(conn)
    }
}

/// Assemble the credential-free connection URL
fn connection_url(config: &LoadConfig) -> Result<String> {
    let scheme = config.dialect.scheme();
    match config.dialect {
        DatabaseType::SQLite => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::config("sqlite requires 'path'"))?;
            Ok(format!("{}://{}", scheme, path.display()))
        }
        DatabaseType::MySQL | DatabaseType::Oracle => {
            let mut url = format!("{}://{}", scheme, config.host());
            if let Some(port) = config.port() {
                url.push_str(&format!(":{}", port));
            }
            url.push('/');
            if let Some(database) = &config.database {
                url.push_str(database);
            }
            Ok(url)
        }
    }
}

fn millis_option(props: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    match props.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("option '{}' must be milliseconds, got '{}'", key, raw))),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, SqliteDialect};
    use crate::connection::Transaction;
    use crate::error::DriverCode;
    use crate::types::{Row, Value};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFactory {
        seen: Mutex<Vec<ConnectionConfig>>,
    }

    #[async_trait]
    impl ConnectionFactory for RecordingFactory {
        async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
            self.seen.lock().unwrap().push(config.clone());
            Err(Error::query("refused"))
        }

        fn database_type(&self) -> DatabaseType {
            DatabaseType::MySQL
        }
    }

    /// Hands out connections that reject every statement
    #[derive(Default)]
    struct RejectingFactory {
        closed: Arc<AtomicBool>,
    }

    struct RejectingConnection {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for RejectingConnection {
        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Err(Error::query("unknown database"))
        }

        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Err(Error::query_with_code("unknown database", DriverCode::vendor(1049)))
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(Error::unsupported("no transactions"))
        }

        async fn is_valid(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionFactory for RejectingFactory {
        async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
            Ok(Box::new(RejectingConnection {
                closed: Arc::clone(&self.closed),
            }))
        }

        fn database_type(&self) -> DatabaseType {
            DatabaseType::MySQL
        }
    }

    fn mysql_config() -> LoadConfig {
        LoadConfig {
            dialect: DatabaseType::MySQL,
            host: Some("db.internal".into()),
            user: Some("loader".into()),
            password: Some(SensitiveString::new("hunter2")),
            database: Some("analytics".into()),
            table: "events".into(),
            ..Default::default()
        }
    }

    fn connector(config: &LoadConfig) -> Connector {
        Connector::new(
            config,
            Arc::new(MySqlDialect),
            Arc::new(RecordingFactory::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_url_assembly() {
        assert_eq!(
            connector(&mysql_config()).url(),
            "mysql://db.internal:3306/analytics"
        );

        let sqlite = LoadConfig {
            path: Some("/tmp/load.db".into()),
            table: "events".into(),
            ..Default::default()
        };
        assert_eq!(connection_url(&sqlite).unwrap(), "sqlite:///tmp/load.db");
    }

    #[test]
    fn test_timeout_profiles() {
        let settings = TimeoutSettings::default();
        let meta = TimeoutProfile::for_mode(&settings, ConnectionMode::Metadata);
        let bulk = TimeoutProfile::for_mode(&settings, ConnectionMode::BulkWrite);
        assert_eq!(meta.connect, Duration::from_millis(300_000));
        assert_eq!(meta.socket, Duration::from_millis(1_800_000));
        assert_eq!(bulk.socket, Duration::from_millis(2_700_000));
    }

    #[test]
    fn test_option_layering() {
        let mut config = mysql_config();
        config
            .options
            .insert("useCompression".into(), "false".into());
        config
            .options
            .insert(SOCKET_TIMEOUT_OPTION.into(), "5000".into());
        let connector = connector(&config);

        let props = connector.options_for(ConnectionMode::BulkWrite);
        assert_eq!(props["rewriteBatchedStatements"], "true");
        assert_eq!(props["useCompression"], "false");
        assert_eq!(props["user"], "loader");
        assert!(!props.contains_key("password"));

        let cc = connector.connection_config(ConnectionMode::BulkWrite).unwrap();
        assert_eq!(cc.socket_timeout_ms, 5000);
        assert_eq!(cc.connect_timeout_ms, 300_000);
        assert_eq!(cc.user.as_deref(), Some("loader"));
        assert_eq!(cc.password.as_ref().map(|p| p.expose_secret()), Some("hunter2"));
        assert!(!format!("{:?}", cc).contains("hunter2"));
    }

    #[test]
    fn test_bad_timeout_option() {
        let mut config = mysql_config();
        config
            .options
            .insert(CONNECT_TIMEOUT_OPTION.into(), "soon".into());
        let err = connector(&config)
            .connection_config(ConnectionMode::Metadata)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_factory_dialect_mismatch() {
        let err = Connector::new(
            &mysql_config(),
            Arc::new(SqliteDialect),
            Arc::new(RecordingFactory::default()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_failed_search_path_closes_connection() {
        let factory = Arc::new(RejectingFactory::default());
        let closed = Arc::clone(&factory.closed);
        let connector = Connector::new(&mysql_config(), Arc::new(MySqlDialect), factory).unwrap();

        let err = connector.open(ConnectionMode::Metadata).await.err().expect("open should fail");
        assert_eq!(err.driver_code(), Some(&DriverCode::vendor(1049)));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_open_failure_is_connection_failure() {
        let err = connector(&mysql_config())
            .open(ConnectionMode::Metadata)
            .await
            .err().expect("open should fail");
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    }
}
