//! Query and Schema Operations
//!
//! The pipeline between validated requests and the driver layer: security
//! gates, row caps, timing, error classification and a short-TTL cache for
//! introspection results.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::GatewayLimits;
use crate::engine::dialect::ColumnDescription;
use crate::engine::{
    dialect_for, filter_system_databases, ConnectionDescriptor, Dialect, PooledConn,
};
use crate::error::Result;
use crate::manager::ConnectionManager;
use crate::security;

/// Result of one read query after the row cap was applied
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Rows returned after truncation
    pub returned_rows: usize,

    /// Rows the statement produced before truncation
    pub total_rows: usize,

    /// Whether the row cap dropped any rows
    pub truncated: bool,

    /// Wall-clock execution time in milliseconds
    pub execution_time_ms: u64,
}

/// Tables and columns of one database, the unit the schema cache stores
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub database: String,
    pub tables: Vec<String>,
    pub columns: HashMap<String, Vec<ColumnDescription>>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    fingerprint: String,
    operation: &'static str,
    table: String,
}

#[derive(Clone)]
enum CachedIntrospection {
    Names(Vec<String>),
    Columns(Vec<ColumnDescription>),
}

struct CacheEntry {
    value: CachedIntrospection,
    cached_at: Instant,
}

/// Introspection and query execution over the connection manager
pub struct QueryOperations {
    manager: Arc<ConnectionManager>,
    limits: GatewayLimits,
    cache: DashMap<CacheKey, CacheEntry>,
}

impl QueryOperations {
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>, limits: GatewayLimits) -> Self {
        Self { manager, limits, cache: DashMap::new() }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    #[must_use]
    pub const fn limits(&self) -> &GatewayLimits {
        &self.limits
    }

    /// List user databases, hiding system databases and, on remote servers,
    /// the engine's default admin database.
    ///
    /// Engines without a database listing (`SQLite`, Oracle) report the single
    /// database the descriptor points at.
    pub async fn list_databases(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Vec<String>> {
        let dialect = dialect_for(descriptor.engine);

        let Some(sql) = dialect.list_databases_sql(descriptor.remote) else {
            return Ok(vec![single_database_name(descriptor)]);
        };

        let key = self.cache_key(descriptor, "databases", "");
        if let Some(names) = self.cached_names(&key) {
            return Ok(names);
        }

        let mut conn = self.connection(user, descriptor).await?;
        let raw = conn.fetch(&sql).await?;
        let names = filter_system_databases(dialect, raw.first_column_strings());

        self.store_names(key, &names);
        Ok(names)
    }

    /// List schemas; engines without schema support report their implicit
    /// default scope
    pub async fn list_schemas(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Vec<String>> {
        let dialect = dialect_for(descriptor.engine);

        let Some(sql) = dialect.list_schemas_sql() else {
            return Ok(dialect.default_schema().map(str::to_string).into_iter().collect());
        };

        let mut conn = self.connection(user, descriptor).await?;
        let raw = conn.fetch(sql).await?;
        Ok(raw.first_column_strings())
    }

    /// List base tables in the descriptor's scope
    pub async fn list_tables(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Vec<String>> {
        let dialect = dialect_for(descriptor.engine);
        let scope = introspection_scope(descriptor, dialect)?;

        let key = self.cache_key(descriptor, "tables", "");
        if let Some(names) = self.cached_names(&key) {
            return Ok(names);
        }

        let mut conn = self.connection(user, descriptor).await?;
        let raw = conn.fetch(&dialect.list_tables_sql(&scope)).await?;
        let names = raw.first_column_strings();

        self.store_names(key, &names);
        Ok(names)
    }

    /// Describe the columns of one table
    pub async fn describe_table(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
        table: &str,
    ) -> Result<Vec<ColumnDescription>> {
        security::validate_identifier(table)?;
        let dialect = dialect_for(descriptor.engine);
        let scope = introspection_scope(descriptor, dialect)?;

        let key = self.cache_key(descriptor, "describe", table);
        if let Some(entry) = self.cache.get(&key) {
            if entry.cached_at.elapsed() < self.limits.introspection_cache_ttl() {
                if let CachedIntrospection::Columns(columns) = &entry.value {
                    return Ok(columns.clone());
                }
            }
        }

        let mut conn = self.connection(user, descriptor).await?;
        let raw = conn.fetch(&dialect.describe_table_sql(&scope, table)).await?;

        let columns: Vec<ColumnDescription> =
            raw.rows.iter().filter_map(|row| dialect.column_from_describe_row(row)).collect();

        self.cache.insert(
            key,
            CacheEntry {
                value: CachedIntrospection::Columns(columns.clone()),
                cached_at: Instant::now(),
            },
        );
        Ok(columns)
    }

    /// Count rows in a table
    pub async fn row_count(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
        table: &str,
    ) -> Result<u64> {
        security::validate_identifier(table)?;
        let dialect = dialect_for(descriptor.engine);

        let mut conn = self.connection(user, descriptor).await?;
        let raw = conn.fetch(&dialect.count_sql(table)).await?;

        let count = raw
            .rows
            .first()
            .and_then(|row| row.first())
            .map_or(0, |value| match value {
                serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
                serde_json::Value::String(s) => s.parse().unwrap_or(0),
                _ => 0,
            });
        Ok(count)
    }

    /// Fetch up to `rows` sample rows using the engine's limiting clause
    pub async fn sample_rows(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
        table: &str,
        rows: u32,
    ) -> Result<QueryResult> {
        security::validate_identifier(table)?;
        let dialect = dialect_for(descriptor.engine);

        let mut conn = self.connection(user, descriptor).await?;
        let started = Instant::now();
        let raw = conn.fetch(&dialect.sample_sql(table, rows)).await?;
        let elapsed_ms = elapsed_ms(started);

        let total = raw.rows.len();
        Ok(QueryResult {
            columns: raw.columns,
            rows: raw.rows,
            returned_rows: total,
            total_rows: total,
            truncated: false,
            execution_time_ms: elapsed_ms,
        })
    }

    /// Run one read-only query through the full pipeline: length gate,
    /// analyzer gate, best-effort session timeout, execution, timing and the
    /// row cap.
    pub async fn run_query(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        max_rows: Option<u32>,
        timeout_secs: Option<u64>,
    ) -> Result<QueryResult> {
        security::check_query_length(sql, self.limits.max_query_length)?;
        security::ensure_read_only(sql)?;

        let cap = max_rows
            .unwrap_or(self.limits.default_max_rows)
            .clamp(1, self.limits.absolute_max_rows) as usize;

        let dialect = dialect_for(descriptor.engine);
        let mut conn = self.connection(user, descriptor).await?;

        // Advisory only; engines without a session timeout run unbounded
        let timeout = timeout_secs.unwrap_or(self.limits.default_timeout_secs);
        if let Some(timeout_sql) = dialect.set_timeout_sql(timeout) {
            if let Err(e) = conn.execute(&timeout_sql).await {
                tracing::warn!(engine = %descriptor.engine, error = %e, "failed to set session timeout");
            }
        }

        let started = Instant::now();
        let raw = conn.fetch(sql).await?;
        let elapsed_ms = elapsed_ms(started);

        let total_rows = raw.rows.len();
        let mut rows = raw.rows;
        rows.truncate(cap);
        let returned_rows = rows.len();

        tracing::debug!(
            user,
            engine = %descriptor.engine,
            total_rows,
            returned_rows,
            elapsed_ms,
            "query executed"
        );

        Ok(QueryResult {
            columns: raw.columns,
            rows,
            returned_rows,
            total_rows,
            truncated: returned_rows < total_rows,
            execution_time_ms: elapsed_ms,
        })
    }

    /// Tables plus per-table columns in one pass, the payload that (re)fills
    /// a user's schema cache. Uses the engine's batch column statement when it
    /// has one, a per-table loop otherwise.
    pub async fn fetch_schema_snapshot(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SchemaSnapshot> {
        let dialect = dialect_for(descriptor.engine);
        let scope = introspection_scope(descriptor, dialect)?;
        let tables = self.list_tables(user, descriptor).await?;

        let mut columns: HashMap<String, Vec<ColumnDescription>> = HashMap::new();

        if let Some(batch_sql) = dialect.batch_columns_sql(&scope, &tables) {
            let mut conn = self.connection(user, descriptor).await?;
            let raw = conn.fetch(&batch_sql).await?;
            // Batch shape: (table_name, column_name, data_type)
            for row in &raw.rows {
                let (Some(table), Some(column)) = (
                    row.first().and_then(serde_json::Value::as_str),
                    row.get(1).and_then(serde_json::Value::as_str),
                ) else {
                    continue;
                };
                columns.entry(table.to_string()).or_default().push(ColumnDescription {
                    name: column.to_string(),
                    data_type: row
                        .get(2)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    nullable: true,
                    default: None,
                });
            }
        } else {
            for table in &tables {
                columns
                    .insert(table.clone(), self.describe_table(user, descriptor, table).await?);
            }
        }

        Ok(SchemaSnapshot {
            database: single_database_name(descriptor),
            tables,
            columns,
        })
    }

    /// Drop every cached introspection result. Called when a user's
    /// descriptor changes.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Acquire a connection, first evicting every cache entry belonging to
    /// the descriptor the user is switching away from. The cache would
    /// otherwise grow without bound across descriptor switches.
    async fn connection(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<PooledConn> {
        if let Some(previous) = self.manager.active_descriptor(user) {
            let stale = previous.fingerprint();
            if stale != descriptor.fingerprint() {
                self.cache.retain(|key, _| key.fingerprint != stale);
            }
        }
        self.manager.acquire(user, descriptor).await
    }

    fn cache_key(
        &self,
        descriptor: &ConnectionDescriptor,
        operation: &'static str,
        table: &str,
    ) -> CacheKey {
        CacheKey {
            fingerprint: descriptor.fingerprint(),
            operation,
            table: table.to_string(),
        }
    }

    fn cached_names(&self, key: &CacheKey) -> Option<Vec<String>> {
        let entry = self.cache.get(key)?;
        if entry.cached_at.elapsed() >= self.limits.introspection_cache_ttl() {
            return None;
        }
        match &entry.value {
            CachedIntrospection::Names(names) => Some(names.clone()),
            CachedIntrospection::Columns(_) => None,
        }
    }

    fn store_names(&self, key: CacheKey, names: &[String]) {
        self.cache.insert(
            key,
            CacheEntry {
                value: CachedIntrospection::Names(names.to_vec()),
                cached_at: Instant::now(),
            },
        );
    }
}

/// Name reported for engines whose descriptor addresses exactly one database
fn single_database_name(descriptor: &ConnectionDescriptor) -> String {
    descriptor.database.clone().unwrap_or_else(|| {
        dialect_for(descriptor.engine)
            .default_schema()
            .unwrap_or("main")
            .to_string()
    })
}

/// Validated scope (schema or database) identifiers are resolved against
fn introspection_scope(
    descriptor: &ConnectionDescriptor,
    dialect: &dyn Dialect,
) -> Result<String> {
    let scope = descriptor
        .schema
        .clone()
        .or_else(|| dialect.default_schema().map(str::to_string))
        .or_else(|| descriptor.database.clone())
        .unwrap_or_default();
    if !scope.is_empty() {
        security::validate_identifier(&scope)?;
    }
    Ok(scope)
}

/// Milliseconds since `started`, saturating
fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use std::path::PathBuf;

    fn ops_with(limits: GatewayLimits) -> QueryOperations {
        QueryOperations::new(Arc::new(ConnectionManager::new(limits.clone())), limits)
    }

    fn seeded_sqlite(name: &str) -> ConnectionDescriptor {
        let path =
            std::env::temp_dir().join(format!("colloquy_ops_{name}_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT NOT NULL, qty INTEGER);
             CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO orders (item, qty) VALUES ('widget', 2), ('gadget', 1), ('sprocket', 7);
             INSERT INTO customers (name) VALUES ('alice'), ('bob');",
        )
        .unwrap();
        ConnectionDescriptor::sqlite(path)
    }

    #[tokio::test]
    async fn test_list_databases_without_server() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("dbs");
        let databases = ops.list_databases("alice", &descriptor).await.unwrap();
        assert_eq!(databases, vec!["main"]);
    }

    #[tokio::test]
    async fn test_list_tables() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("tables");
        let tables = ops.list_tables("alice", &descriptor).await.unwrap();
        assert_eq!(tables, vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_describe_table() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("describe");
        let columns = ops.describe_table("alice", &descriptor, "orders").await.unwrap();

        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[1].name, "item");
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].name, "qty");
        assert!(columns[2].nullable);
    }

    #[tokio::test]
    async fn test_describe_rejects_bad_identifier() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("badident");
        let err =
            ops.describe_table("alice", &descriptor, "orders; DROP TABLE x").await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_row_count() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("count");
        assert_eq!(ops.row_count("alice", &descriptor, "orders").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sample_rows_limited() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("sample");
        let result = ops.sample_rows("alice", &descriptor, "orders", 2).await.unwrap();
        assert_eq!(result.returned_rows, 2);
    }

    #[tokio::test]
    async fn test_run_query_truncates_and_reports() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("truncate");
        let result = ops
            .run_query("alice", &descriptor, "SELECT * FROM orders", Some(2), None)
            .await
            .unwrap();

        assert_eq!(result.returned_rows, 2);
        assert_eq!(result.total_rows, 3);
        assert!(result.truncated);
        assert_eq!(result.columns, vec!["id", "item", "qty"]);
    }

    #[tokio::test]
    async fn test_run_query_rejects_writes() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("writes");
        let err = ops
            .run_query("alice", &descriptor, "DELETE FROM orders", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SECURITY_REJECTION");
    }

    #[tokio::test]
    async fn test_run_query_classifies_missing_table() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("missing");
        let err = ops
            .run_query("alice", &descriptor, "SELECT * FROM nonexistent", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "QUERY_FAILED");
        assert!(err.message().contains("Table not found"));
    }

    #[tokio::test]
    async fn test_introspection_cache_expires() {
        let limits = GatewayLimits { introspection_cache_ttl_secs: 0, ..Default::default() };
        let ops = ops_with(limits);
        let descriptor = seeded_sqlite("ttl");

        ops.list_tables("alice", &descriptor).await.unwrap();
        assert_eq!(ops.cache_len(), 1);

        // Zero TTL means every read misses and refetches
        let tables = ops.list_tables("alice", &descriptor).await.unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_cache() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("invalidate");

        ops.list_tables("alice", &descriptor).await.unwrap();
        assert!(ops.cache_len() > 0);

        ops.invalidate_all();
        assert_eq!(ops.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_descriptor_switch_evicts_stale_cache() {
        let ops = ops_with(GatewayLimits::default());
        let first = seeded_sqlite("switch_a");
        let second = seeded_sqlite("switch_b");

        ops.list_tables("alice", &first).await.unwrap();
        ops.describe_table("alice", &first, "orders").await.unwrap();
        assert_eq!(ops.cache_len(), 2);

        // Switching descriptors drops every entry keyed by the old
        // fingerprint before the new pool is built
        ops.list_tables("alice", &second).await.unwrap();
        assert_eq!(ops.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_schema_snapshot() {
        let ops = ops_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("snapshot");
        let snapshot = ops.fetch_schema_snapshot("alice", &descriptor).await.unwrap();

        assert_eq!(snapshot.database, "main");
        assert_eq!(snapshot.tables, vec!["customers", "orders"]);
        assert_eq!(snapshot.columns["orders"].len(), 3);
        assert_eq!(snapshot.columns["customers"].len(), 2);
    }

    #[test]
    fn test_scope_resolution_per_engine() {
        let pg = ConnectionDescriptor::postgres(
            "h".to_string(),
            5432,
            "u".to_string(),
            "p".to_string(),
            "shop".to_string(),
        );
        assert_eq!(
            introspection_scope(&pg, dialect_for(EngineKind::Postgres)).unwrap(),
            "public"
        );
        assert_eq!(
            introspection_scope(
                &pg.clone().with_schema("sales"),
                dialect_for(EngineKind::Postgres)
            )
            .unwrap(),
            "sales"
        );

        let mysql = ConnectionDescriptor::mysql(
            "h".to_string(),
            3306,
            "u".to_string(),
            "p".to_string(),
            "shop".to_string(),
        );
        assert_eq!(introspection_scope(&mysql, dialect_for(EngineKind::MySql)).unwrap(), "shop");

        let sqlite = ConnectionDescriptor::sqlite(PathBuf::from("/tmp/x.db"));
        assert_eq!(introspection_scope(&sqlite, dialect_for(EngineKind::Sqlite)).unwrap(), "main");
    }
}
