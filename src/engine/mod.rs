//! Database Engines: Core Types, Dialects and the Driver Facade
//!
//! This module defines the adapter abstraction that hides five SQL dialects
//! behind one interface.
//!
//! # Two layers
//! - The [`Dialect`] layer (in [`dialect`]) is pure: SQL text, ports, system
//!   schema exclusion sets, probe statements. It is always compiled for all
//!   five engines so introspection planning and tests never need a server.
//! - The driver layer is feature-gated per engine. [`PoolHandle`] wraps the
//!   engine's pool or connection factory and [`PooledConn`] exposes uniform
//!   `fetch`/`execute`/`probe` operations over it.
//!
//! # Engine Isolation
//! Each driver implementation is completely independent. No shared SQL
//! helpers or cross-engine driver abstractions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::GatewayLimits;
use crate::error::{GatewayError, Result};

pub mod dialect;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

#[cfg(feature = "oracle")]
pub mod oracle;

pub use dialect::{dialect_for, Dialect};

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySql,
    /// `SQLite` database
    Sqlite,
    /// Microsoft SQL Server
    SqlServer,
    /// Oracle Database
    Oracle,
}

impl EngineKind {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
            Self::Oracle => "oracle",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = GatewayError;

    /// Parse an engine name, accepting the common aliases. Unknown names fail
    /// with `UNSUPPORTED_ENGINE` so callers never fall through to a default.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "sqlserver" | "mssql" => Ok(Self::SqlServer),
            "oracle" => Ok(Self::Oracle),
            other => Err(GatewayError::unsupported_engine(other)),
        }
    }
}

/// Resolved identity of one target database connection
///
/// Immutable once established; reconnecting or switching database/schema
/// replaces the descriptor wholesale (and with it the pool entry it keys).
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Database engine type
    pub engine: EngineKind,

    /// Hostname (server engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (server engines; engine default when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username (server engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password
    /// WARNING: Sensitive data, excluded from Debug/Display and fingerprints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database file path (sqlite)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// DSN / Easy Connect string (oracle)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,

    /// Selected database name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Selected schema (engine-dependent default when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Whether the target is a remote/managed server (affects which admin
    /// databases are hidden from listings)
    #[serde(default)]
    pub remote: bool,
}

impl ConnectionDescriptor {
    /// Create a `PostgreSQL` descriptor
    #[must_use]
    pub const fn postgres(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: EngineKind::Postgres,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            file: None,
            dsn: None,
            database: Some(database),
            schema: None,
            remote: false,
        }
    }

    /// Create a `MySQL` descriptor
    #[must_use]
    pub const fn mysql(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: EngineKind::MySql,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            file: None,
            dsn: None,
            database: Some(database),
            schema: None,
            remote: false,
        }
    }

    /// Create a `SQLite` descriptor
    #[must_use]
    pub const fn sqlite(file: PathBuf) -> Self {
        Self {
            engine: EngineKind::Sqlite,
            host: None,
            port: None,
            user: None,
            password: None,
            file: Some(file),
            dsn: None,
            database: None,
            schema: None,
            remote: false,
        }
    }

    /// Create a SQL Server descriptor
    #[must_use]
    pub const fn sqlserver(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: EngineKind::SqlServer,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            file: None,
            dsn: None,
            database: Some(database),
            schema: None,
            remote: false,
        }
    }

    /// Create an Oracle descriptor from an Easy Connect DSN
    #[must_use]
    pub const fn oracle(user: String, password: String, dsn: String) -> Self {
        Self {
            engine: EngineKind::Oracle,
            host: None,
            port: None,
            user: Some(user),
            password: Some(password),
            file: None,
            dsn: Some(dsn),
            database: None,
            schema: None,
            remote: false,
        }
    }

    /// Mark the descriptor as pointing at a remote/managed server
    #[must_use]
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Select a schema, replacing any prior selection
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Effective port, falling back to the engine default
    #[must_use]
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| dialect_for(self.engine).default_port())
    }

    /// Stable identity string used as the pool key component.
    ///
    /// The password is deliberately excluded: fingerprints appear in logs and
    /// cache keys.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.engine,
            self.host.as_deref().unwrap_or(""),
            self.effective_port().map_or_else(String::new, |p| p.to_string()),
            self.user.as_deref().unwrap_or(""),
            self.file.as_deref().map_or_else(String::new, |p| p.display().to_string()),
            self.dsn.as_deref().unwrap_or(""),
            self.database.as_deref().unwrap_or(""),
            self.schema.as_deref().unwrap_or(""),
            self.remote,
        )
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("file", &self.file)
            .field("dsn", &self.dsn)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("remote", &self.remote)
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine {
            EngineKind::Sqlite => {
                write!(f, "sqlite:{}", self.file.as_deref().unwrap_or_else(|| std::path::Path::new("?")).display())
            }
            EngineKind::Oracle => {
                write!(f, "oracle:{}", self.dsn.as_deref().unwrap_or("?"))
            }
            engine => write!(
                f,
                "{engine}://{}@{}:{}/{}",
                self.user.as_deref().unwrap_or("?"),
                self.host.as_deref().unwrap_or("?"),
                self.effective_port().map_or_else(|| "?".to_string(), |p| p.to_string()),
                self.database.as_deref().unwrap_or(""),
            ),
        }
    }
}

/// Raw result of one fetch: column names plus JSON-safe row values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRows {
    /// Column names in result-set order
    pub columns: Vec<String>,

    /// Result rows as positional JSON values
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl RawRows {
    /// First column of every row as strings, the shape of name listings
    #[must_use]
    pub fn first_column_strings(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

/// Case-insensitive filter removing an engine's system databases/schemas from
/// a listing
#[must_use]
pub fn filter_system_databases(dialect: &dyn Dialect, names: Vec<String>) -> Vec<String> {
    let excluded = dialect.system_databases();
    names
        .into_iter()
        .filter(|name| !excluded.iter().any(|sys| sys.eq_ignore_ascii_case(name)))
        .collect()
}

/// A live pool (or connection factory) for one descriptor
///
/// Pooling drivers (`PostgreSQL`, `MySQL`, SQL Server) hold a real pool;
/// file-/DSN-style engines (`SQLite`, Oracle) hold a factory that opens a
/// fresh connection per acquisition, disguised behind the same interface.
pub enum PoolHandle {
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgPool),

    #[cfg(feature = "mysql")]
    MySql(mysql_async::Pool),

    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteFactory),

    #[cfg(feature = "sqlserver")]
    SqlServer(sqlserver::MssqlPool),

    #[cfg(feature = "oracle")]
    Oracle(oracle::OracleFactory),
}

impl PoolHandle {
    /// Create the pool (or factory) for a descriptor.
    ///
    /// Fails with `UNSUPPORTED_ENGINE` when the engine's driver feature is
    /// not compiled in.
    pub async fn create(descriptor: &ConnectionDescriptor, limits: &GatewayLimits) -> Result<Self> {
        let _ = limits; // only pooling drivers read the pool size
        match descriptor.engine {
            #[cfg(feature = "postgres")]
            EngineKind::Postgres => Ok(Self::Postgres(postgres::create_pool(descriptor, limits).await?)),

            #[cfg(feature = "mysql")]
            EngineKind::MySql => Ok(Self::MySql(mysql::create_pool(descriptor, limits)?)),

            #[cfg(feature = "sqlite")]
            EngineKind::Sqlite => Ok(Self::Sqlite(sqlite::SqliteFactory::new(descriptor)?)),

            #[cfg(feature = "sqlserver")]
            EngineKind::SqlServer => {
                Ok(Self::SqlServer(sqlserver::create_pool(descriptor, limits).await?))
            }

            #[cfg(feature = "oracle")]
            EngineKind::Oracle => Ok(Self::Oracle(oracle::OracleFactory::new(descriptor)?)),

            #[allow(unreachable_patterns)]
            engine => Err(GatewayError::unsupported_engine(format!(
                "{engine} (driver not compiled into this build)"
            ))),
        }
    }

    /// Engine this handle serves
    #[must_use]
    pub fn engine(&self) -> EngineKind {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => EngineKind::Postgres,
            #[cfg(feature = "mysql")]
            Self::MySql(_) => EngineKind::MySql,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => EngineKind::Sqlite,
            #[cfg(feature = "sqlserver")]
            Self::SqlServer(_) => EngineKind::SqlServer,
            #[cfg(feature = "oracle")]
            Self::Oracle(_) => EngineKind::Oracle,

            #[cfg(not(any(
                feature = "postgres",
                feature = "mysql",
                feature = "sqlite",
                feature = "sqlserver",
                feature = "oracle"
            )))]
            _ => unreachable!("no database engine features enabled"),
        }
    }

    /// Acquire a connection. The returned guard gives the connection back to
    /// its pool on drop (factories simply drop it), on every exit path.
    pub async fn acquire(&self) -> Result<PooledConn> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => Ok(PooledConn::Postgres(postgres::acquire(pool).await?)),

            #[cfg(feature = "mysql")]
            Self::MySql(pool) => {
                let conn = pool.get_conn().await.map_err(|e| {
                    GatewayError::connection_failed(format!("Failed to get MySQL connection: {e}"))
                })?;
                Ok(PooledConn::MySql(conn))
            }

            #[cfg(feature = "sqlite")]
            Self::Sqlite(factory) => Ok(PooledConn::Sqlite(factory.open()?)),

            #[cfg(feature = "sqlserver")]
            Self::SqlServer(pool) => Ok(PooledConn::SqlServer(sqlserver::acquire(pool).await?)),

            #[cfg(feature = "oracle")]
            Self::Oracle(factory) => Ok(PooledConn::Oracle(factory.open()?)),

            #[cfg(not(any(
                feature = "postgres",
                feature = "mysql",
                feature = "sqlite",
                feature = "sqlserver",
                feature = "oracle"
            )))]
            _ => unreachable!("no database engine features enabled"),
        }
    }

    /// Shut the pool down. `MySQL` requires an explicit disconnect; the other
    /// drivers release their server-side connections on drop.
    pub async fn close(&self) -> Result<()> {
        match self {
            // mysql_async::Pool is a cheap handle; disconnect consumes a clone
            #[cfg(feature = "mysql")]
            Self::MySql(pool) => pool.clone().disconnect().await.map_err(|e| {
                GatewayError::connection_failed(format!("Failed to close MySQL pool: {e}"))
            }),
            #[allow(unreachable_patterns)]
            _ => Ok(()),
        }
    }
}

/// An acquired connection, uniform across engines
pub enum PooledConn {
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgConn),

    #[cfg(feature = "mysql")]
    MySql(mysql_async::Conn),

    #[cfg(feature = "sqlite")]
    Sqlite(rusqlite::Connection),

    #[cfg(feature = "sqlserver")]
    SqlServer(sqlserver::MssqlConn),

    #[cfg(feature = "oracle")]
    Oracle(::oracle::Connection),
}

impl PooledConn {
    /// Execute a result-producing statement and collect all rows as JSON-safe
    /// values. Driver errors propagate unclassified.
    pub async fn fetch(&mut self, sql: &str) -> Result<RawRows> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::fetch(conn, sql).await,

            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::fetch(conn, sql).await,

            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::fetch(conn, sql),

            #[cfg(feature = "sqlserver")]
            Self::SqlServer(conn) => sqlserver::fetch(conn, sql).await,

            #[cfg(feature = "oracle")]
            Self::Oracle(conn) => oracle::fetch(conn, sql),

            #[cfg(not(any(
                feature = "postgres",
                feature = "mysql",
                feature = "sqlite",
                feature = "sqlserver",
                feature = "oracle"
            )))]
            _ => unreachable!("no database engine features enabled"),
        }
    }

    /// Execute a statement where no result set is expected (session settings
    /// such as timeouts)
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::execute(conn, sql).await,

            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::execute(conn, sql).await,

            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::execute(conn, sql),

            #[cfg(feature = "sqlserver")]
            Self::SqlServer(conn) => sqlserver::execute(conn, sql).await,

            #[cfg(feature = "oracle")]
            Self::Oracle(conn) => oracle::execute(conn, sql),

            #[cfg(not(any(
                feature = "postgres",
                feature = "mysql",
                feature = "sqlite",
                feature = "sqlserver",
                feature = "oracle"
            )))]
            _ => unreachable!("no database engine features enabled"),
        }
    }

    /// Run the engine's trivial liveness probe
    pub async fn probe(&mut self, dialect: &dyn Dialect) -> Result<()> {
        self.fetch(dialect.probe_sql()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_engine_kind_serialization() {
        assert_eq!(serde_json::to_string(&EngineKind::Postgres).unwrap(), r#""postgres""#);
        assert_eq!(serde_json::to_string(&EngineKind::MySql).unwrap(), r#""mysql""#);
        assert_eq!(serde_json::to_string(&EngineKind::Sqlite).unwrap(), r#""sqlite""#);
        assert_eq!(serde_json::to_string(&EngineKind::SqlServer).unwrap(), r#""sqlserver""#);
        assert_eq!(serde_json::to_string(&EngineKind::Oracle).unwrap(), r#""oracle""#);
    }

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("postgres".parse::<EngineKind>().unwrap(), EngineKind::Postgres);
        assert_eq!("PostgreSQL".parse::<EngineKind>().unwrap(), EngineKind::Postgres);
        assert_eq!("mariadb".parse::<EngineKind>().unwrap(), EngineKind::MySql);
        assert_eq!("mssql".parse::<EngineKind>().unwrap(), EngineKind::SqlServer);
        assert_eq!("oracle".parse::<EngineKind>().unwrap(), EngineKind::Oracle);

        let err = "mongodb".parse::<EngineKind>().unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_ENGINE");
    }

    #[test]
    fn test_descriptor_constructors() {
        let pg = ConnectionDescriptor::postgres(
            "localhost".to_string(),
            5432,
            "user".to_string(),
            "pass".to_string(),
            "shop".to_string(),
        );
        assert_eq!(pg.engine, EngineKind::Postgres);
        assert_eq!(pg.effective_port(), Some(5432));

        let sqlite = ConnectionDescriptor::sqlite(PathBuf::from("/tmp/test.db"));
        assert_eq!(sqlite.engine, EngineKind::Sqlite);
        assert!(sqlite.file.is_some());
        assert_eq!(sqlite.effective_port(), None);

        let ora = ConnectionDescriptor::oracle(
            "app".to_string(),
            "pass".to_string(),
            "//db.example.com:1521/XEPDB1".to_string(),
        );
        assert_eq!(ora.engine, EngineKind::Oracle);
    }

    #[test]
    fn test_default_ports_applied() {
        let mut mysql = ConnectionDescriptor::mysql(
            "localhost".to_string(),
            3306,
            "u".to_string(),
            "p".to_string(),
            "db".to_string(),
        );
        mysql.port = None;
        assert_eq!(mysql.effective_port(), Some(3306));

        let mut mssql = ConnectionDescriptor::sqlserver(
            "localhost".to_string(),
            1433,
            "sa".to_string(),
            "p".to_string(),
            "db".to_string(),
        );
        mssql.port = None;
        assert_eq!(mssql.effective_port(), Some(1433));
    }

    #[test]
    fn test_fingerprint_excludes_password() {
        let mut a = ConnectionDescriptor::postgres(
            "localhost".to_string(),
            5432,
            "user".to_string(),
            "secret-one".to_string(),
            "shop".to_string(),
        );
        let fingerprint = a.fingerprint();
        assert!(!fingerprint.contains("secret-one"));

        a.password = Some("secret-two".to_string());
        assert_eq!(a.fingerprint(), fingerprint);

        a.database = Some("analytics".to_string());
        assert_ne!(a.fingerprint(), fingerprint);
    }

    #[test]
    fn test_debug_and_display_redact_password() {
        let descriptor = ConnectionDescriptor::postgres(
            "localhost".to_string(),
            5432,
            "user".to_string(),
            "hunter2".to_string(),
            "shop".to_string(),
        );
        let debug = format!("{descriptor:?}");
        let display = format!("{descriptor}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
        assert!(!display.contains("hunter2"));
        assert!(display.contains("postgres://user@localhost:5432/shop"));
    }

    #[test]
    fn test_first_column_strings() {
        let rows = RawRows {
            columns: vec!["name".to_string()],
            rows: vec![
                vec![serde_json::json!("alpha")],
                vec![serde_json::json!("beta")],
                vec![serde_json::json!(42)],
            ],
        };
        assert_eq!(rows.first_column_strings(), vec!["alpha", "beta"]);
    }
}
