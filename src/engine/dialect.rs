//! SQL Dialects
//!
//! One [`Dialect`] implementation per engine translates generic operations
//! (list databases, list tables, describe columns, set timeout, probe) into
//! engine-specific SQL. Dialects are pure and always compiled, independent of
//! which driver features are enabled.
//!
//! Identifier arguments (`scope`, `table`) must already have passed
//! [`crate::security::validate_identifier`]; dialects interpolate them
//! verbatim. Every dialect encodes its own system/internal schema exclusion
//! set so callers never hardcode per-engine lists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EngineKind;

/// Normalized column description assembled from a describe-table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Engine-specific SQL and connection facts
pub trait Dialect: Send + Sync {
    /// Engine this dialect serves
    fn engine(&self) -> EngineKind;

    /// Default TCP port, `None` for file-based engines
    fn default_port(&self) -> Option<u16>;

    /// Whether a server is required (vs. a file path)
    fn requires_server(&self) -> bool;

    /// Default schema when the descriptor selects none
    fn default_schema(&self) -> Option<&'static str> {
        None
    }

    /// System databases/schemas to hide from listings, compared
    /// case-insensitively
    fn system_databases(&self) -> &'static [&'static str];

    /// Default admin database additionally hidden on remote/managed servers
    fn admin_database(&self) -> Option<&'static str> {
        None
    }

    /// SQL listing user databases, `None` for single-database engines
    fn list_databases_sql(&self, remote: bool) -> Option<String>;

    /// SQL listing schemas, for engines where schemas are distinct from
    /// databases
    fn list_schemas_sql(&self) -> Option<&'static str> {
        None
    }

    /// SQL listing base tables within `scope` (schema or database,
    /// engine-dependent)
    fn list_tables_sql(&self, scope: &str) -> String;

    /// SQL describing the columns of one table
    fn describe_table_sql(&self, scope: &str, table: &str) -> String;

    /// SQL fetching (table, column, type) for several tables at once;
    /// `None` when the engine has no batch form and callers must loop
    fn batch_columns_sql(&self, scope: &str, tables: &[String]) -> Option<String>;

    /// SQL selecting up to `rows` sample rows with the engine's limiting
    /// clause
    fn sample_sql(&self, table: &str, rows: u32) -> String;

    /// SQL counting rows in a table
    fn count_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {table}")
    }

    /// Best-effort session statement bounding query time, `None` when the
    /// engine has no such statement
    fn set_timeout_sql(&self, _seconds: u64) -> Option<String> {
        None
    }

    /// Trivial liveness probe
    fn probe_sql(&self) -> &'static str {
        "SELECT 1"
    }

    /// Assemble a normalized column description from one describe-table row.
    ///
    /// The default covers the `information_schema.columns` shape
    /// (name, type, `is_nullable` YES/NO, default); engines with a different
    /// describe shape override this.
    fn column_from_describe_row(&self, row: &[Value]) -> Option<ColumnDescription> {
        Some(ColumnDescription {
            name: row.first()?.as_str()?.to_string(),
            data_type: row.get(1)?.as_str().unwrap_or("").to_string(),
            nullable: row.get(2).and_then(Value::as_str).is_some_and(|v| v.eq_ignore_ascii_case("YES")),
            default: row.get(3).and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Look up the dialect for an engine
#[must_use]
pub fn dialect_for(engine: EngineKind) -> &'static dyn Dialect {
    match engine {
        EngineKind::Postgres => &PostgresDialect,
        EngineKind::MySql => &MySqlDialect,
        EngineKind::Sqlite => &SqliteDialect,
        EngineKind::SqlServer => &SqlServerDialect,
        EngineKind::Oracle => &OracleDialect,
    }
}

/// Quote an identifier list for an `IN (...)` clause
fn quoted_in_list(names: &[String]) -> String {
    names.iter().map(|n| format!("'{n}'")).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn default_port(&self) -> Option<u16> {
        Some(5432)
    }

    fn requires_server(&self) -> bool {
        true
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("public")
    }

    fn system_databases(&self) -> &'static [&'static str] {
        &["template0", "template1"]
    }

    fn admin_database(&self) -> Option<&'static str> {
        Some("postgres")
    }

    fn list_databases_sql(&self, remote: bool) -> Option<String> {
        let mut sql = String::from(
            "SELECT datname FROM pg_catalog.pg_database WHERE datistemplate = false",
        );
        if remote {
            // Managed servers reserve the default admin database
            sql.push_str(" AND datname <> 'postgres'");
        }
        sql.push_str(" ORDER BY datname");
        Some(sql)
    }

    fn list_schemas_sql(&self) -> Option<&'static str> {
        Some(
            "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast') \
             ORDER BY schema_name",
        )
    }

    fn list_tables_sql(&self, scope: &str) -> String {
        format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{scope}' AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        )
    }

    fn describe_table_sql(&self, scope: &str, table: &str) -> String {
        format!(
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_schema = '{scope}' AND table_name = '{table}' \
             ORDER BY ordinal_position"
        )
    }

    fn batch_columns_sql(&self, scope: &str, tables: &[String]) -> Option<String> {
        if tables.is_empty() {
            return None;
        }
        Some(format!(
            "SELECT table_name, column_name, data_type \
             FROM information_schema.columns \
             WHERE table_schema = '{scope}' AND table_name IN ({}) \
             ORDER BY table_name, ordinal_position",
            quoted_in_list(tables)
        ))
    }

    fn sample_sql(&self, table: &str, rows: u32) -> String {
        format!("SELECT * FROM {table} LIMIT {rows}")
    }

    fn set_timeout_sql(&self, seconds: u64) -> Option<String> {
        Some(format!("SET statement_timeout = {}", seconds * 1000))
    }
}

// ---------------------------------------------------------------------------
// MySQL
// ---------------------------------------------------------------------------

pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::MySql
    }

    fn default_port(&self) -> Option<u16> {
        Some(3306)
    }

    fn requires_server(&self) -> bool {
        true
    }

    fn system_databases(&self) -> &'static [&'static str] {
        &["information_schema", "performance_schema", "mysql", "sys"]
    }

    fn list_databases_sql(&self, _remote: bool) -> Option<String> {
        Some("SHOW DATABASES".to_string())
    }

    fn list_tables_sql(&self, scope: &str) -> String {
        // MySQL schemas and databases are the same namespace
        format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{scope}' AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        )
    }

    fn describe_table_sql(&self, scope: &str, table: &str) -> String {
        format!(
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_schema = '{scope}' AND table_name = '{table}' \
             ORDER BY ordinal_position"
        )
    }

    fn batch_columns_sql(&self, scope: &str, tables: &[String]) -> Option<String> {
        if tables.is_empty() {
            return None;
        }
        Some(format!(
            "SELECT table_name, column_name, data_type \
             FROM information_schema.columns \
             WHERE table_schema = '{scope}' AND table_name IN ({}) \
             ORDER BY table_name, ordinal_position",
            quoted_in_list(tables)
        ))
    }

    fn sample_sql(&self, table: &str, rows: u32) -> String {
        format!("SELECT * FROM {table} LIMIT {rows}")
    }

    fn set_timeout_sql(&self, seconds: u64) -> Option<String> {
        // MAX_EXECUTION_TIME only applies to SELECT, which is all the gateway runs
        Some(format!("SET SESSION MAX_EXECUTION_TIME = {}", seconds * 1000))
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    fn default_port(&self) -> Option<u16> {
        None
    }

    fn requires_server(&self) -> bool {
        false
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("main")
    }

    fn system_databases(&self) -> &'static [&'static str] {
        &[]
    }

    fn list_databases_sql(&self, _remote: bool) -> Option<String> {
        // Single-file engine: the file is the only database
        None
    }

    fn list_tables_sql(&self, _scope: &str) -> String {
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name"
            .to_string()
    }

    fn describe_table_sql(&self, _scope: &str, table: &str) -> String {
        format!("PRAGMA table_info({table})")
    }

    fn batch_columns_sql(&self, _scope: &str, _tables: &[String]) -> Option<String> {
        // PRAGMA only describes one table; callers loop
        None
    }

    fn sample_sql(&self, table: &str, rows: u32) -> String {
        format!("SELECT * FROM {table} LIMIT {rows}")
    }

    fn column_from_describe_row(&self, row: &[Value]) -> Option<ColumnDescription> {
        // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
        Some(ColumnDescription {
            name: row.get(1)?.as_str()?.to_string(),
            data_type: row.get(2)?.as_str().unwrap_or("").to_string(),
            nullable: row.get(3).and_then(Value::as_i64) == Some(0),
            default: row.get(4).and_then(Value::as_str).map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// SQL Server
// ---------------------------------------------------------------------------

pub struct SqlServerDialect;

impl SqlServerDialect {
    /// SQL Server quotes identifiers with square brackets
    fn quote_ident(name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }
}

impl Dialect for SqlServerDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    fn default_port(&self) -> Option<u16> {
        Some(1433)
    }

    fn requires_server(&self) -> bool {
        true
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("dbo")
    }

    fn system_databases(&self) -> &'static [&'static str] {
        &["master", "tempdb", "model", "msdb"]
    }

    fn list_databases_sql(&self, _remote: bool) -> Option<String> {
        Some(
            "SELECT name FROM sys.databases \
             WHERE name NOT IN ('master', 'tempdb', 'model', 'msdb') \
             ORDER BY name"
                .to_string(),
        )
    }

    fn list_tables_sql(&self, scope: &str) -> String {
        format!(
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = '{scope}' \
             ORDER BY TABLE_NAME"
        )
    }

    fn describe_table_sql(&self, scope: &str, table: &str) -> String {
        format!(
            "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = '{scope}' AND TABLE_NAME = '{table}' \
             ORDER BY ORDINAL_POSITION"
        )
    }

    fn batch_columns_sql(&self, scope: &str, tables: &[String]) -> Option<String> {
        if tables.is_empty() {
            return None;
        }
        Some(format!(
            "SELECT TABLE_NAME, COLUMN_NAME, DATA_TYPE \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = '{scope}' AND TABLE_NAME IN ({}) \
             ORDER BY TABLE_NAME, ORDINAL_POSITION",
            quoted_in_list(tables)
        ))
    }

    fn sample_sql(&self, table: &str, rows: u32) -> String {
        format!("SELECT TOP {rows} * FROM {}", Self::quote_ident(table))
    }

    fn count_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", Self::quote_ident(table))
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::Oracle
    }

    fn default_port(&self) -> Option<u16> {
        Some(1521)
    }

    fn requires_server(&self) -> bool {
        true
    }

    fn system_databases(&self) -> &'static [&'static str] {
        &[
            "SYS", "SYSTEM", "ORACLE_OCM", "XDB", "WMSYS", "CTXSYS", "MDSYS", "OLAPSYS",
            "ORDDATA", "ORDSYS", "OUTLN", "DBSNMP", "APPQOSSYS", "ANONYMOUS",
        ]
    }

    fn list_databases_sql(&self, _remote: bool) -> Option<String> {
        // Oracle exposes schemas (users) where other engines expose databases
        Some(format!(
            "SELECT username FROM all_users WHERE username NOT IN ({}) ORDER BY username",
            quoted_in_list(
                &self.system_databases().iter().map(ToString::to_string).collect::<Vec<_>>()
            )
        ))
    }

    fn list_tables_sql(&self, scope: &str) -> String {
        format!(
            "SELECT table_name FROM all_tables WHERE owner = '{}' ORDER BY table_name",
            scope.to_uppercase()
        )
    }

    fn describe_table_sql(&self, scope: &str, table: &str) -> String {
        format!(
            "SELECT column_name, data_type, nullable, data_default \
             FROM all_tab_columns \
             WHERE owner = '{}' AND table_name = '{}' \
             ORDER BY column_id",
            scope.to_uppercase(),
            table.to_uppercase()
        )
    }

    fn batch_columns_sql(&self, scope: &str, tables: &[String]) -> Option<String> {
        if tables.is_empty() {
            return None;
        }
        let upper: Vec<String> = tables.iter().map(|t| t.to_uppercase()).collect();
        Some(format!(
            "SELECT table_name, column_name, data_type \
             FROM all_tab_columns \
             WHERE owner = '{}' AND table_name IN ({}) \
             ORDER BY table_name, column_id",
            scope.to_uppercase(),
            quoted_in_list(&upper)
        ))
    }

    fn sample_sql(&self, table: &str, rows: u32) -> String {
        format!("SELECT * FROM {table} WHERE ROWNUM <= {rows}")
    }

    fn probe_sql(&self) -> &'static str {
        "SELECT 1 FROM DUAL"
    }

    fn column_from_describe_row(&self, row: &[Value]) -> Option<ColumnDescription> {
        // all_tab_columns: column_name, data_type, nullable ('Y'/'N'), data_default
        Some(ColumnDescription {
            name: row.first()?.as_str()?.to_string(),
            data_type: row.get(1)?.as_str().unwrap_or("").to_string(),
            nullable: row.get(2).and_then(Value::as_str).is_some_and(|v| v.eq_ignore_ascii_case("Y")),
            default: row.get(3).and_then(Value::as_str).map(str::to_string),
        })
    }
}
