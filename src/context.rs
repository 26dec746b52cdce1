//! Per-User Context Store
//!
//! Session-scoped state the gateway keeps per user: the active connection
//! context, TTL-bounded schema caches, a short query history ring and user
//! preferences. Persistence goes through the [`ContextRepository`] trait; the
//! crate ships an in-memory implementation and durable backends are host
//! concerns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::config::GatewayLimits;
use crate::engine::dialect::ColumnDescription;
use crate::engine::{ConnectionDescriptor, EngineKind};
use crate::error::Result;
use crate::manager::ConnectionManager;
use crate::ops::SchemaSnapshot;

/// Stored queries are truncated to this many characters
pub const MAX_HISTORY_QUERY_LENGTH: usize = 500;

/// The active connection as the context store remembers it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub connected: bool,
    pub engine: EngineKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub remote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Cached schema of one database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCacheEntry {
    pub database: String,
    pub tables: Vec<String>,
    pub columns: HashMap<String, Vec<ColumnDescription>>,
    pub content_hash: u64,
    pub cached_at: DateTime<Utc>,
}

/// Outcome recorded for one executed query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Error,
}

/// One entry of the per-user query history ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHistoryEntry {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub row_count: usize,
    pub status: QueryStatus,
    pub executed_at: DateTime<Utc>,
}

/// Per-user preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Minutes a connection is trusted without a probe (0 = always probe)
    pub persistence_minutes: u32,
}

/// Everything the repository persists for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionContext>,
    pub schemas: HashMap<String, SchemaCacheEntry>,
    pub history: VecDeque<QueryHistoryEntry>,
    pub preferences: UserPreferences,
}

impl UserContext {
    fn new(default_persistence_minutes: u32) -> Self {
        Self {
            connection: None,
            schemas: HashMap::new(),
            history: VecDeque::new(),
            preferences: UserPreferences { persistence_minutes: default_persistence_minutes },
        }
    }
}

/// Result of the connection state check
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// A live, recently validated connection
    Connected(ConnectionContext),

    /// No live session configuration for this user
    SessionExpired,

    /// The stored connection existed but its pool no longer answers probes
    PoolDead,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::SessionExpired => "session_expired",
            Self::PoolDead => "db_pool_dead",
        }
    }
}

/// Persistence seam for user contexts
#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn load(&self, user: &str) -> Result<Option<UserContext>>;
    async fn save(&self, user: &str, context: &UserContext) -> Result<()>;
    async fn delete(&self, user: &str) -> Result<()>;
}

/// `DashMap`-backed repository for tests and single-process hosts
#[derive(Default)]
pub struct InMemoryContextRepository {
    contexts: DashMap<String, UserContext>,
}

impl InMemoryContextRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn load(&self, user: &str) -> Result<Option<UserContext>> {
        Ok(self.contexts.get(user).map(|c| c.clone()))
    }

    async fn save(&self, user: &str, context: &UserContext) -> Result<()> {
        self.contexts.insert(user.to_string(), context.clone());
        Ok(())
    }

    async fn delete(&self, user: &str) -> Result<()> {
        self.contexts.remove(user);
        Ok(())
    }
}

/// Staleness-aware view over the repository
///
/// All reads apply TTLs without deleting expired data; only the explicit
/// invalidation methods delete.
pub struct ContextStore {
    repository: Arc<dyn ContextRepository>,
    manager: Arc<ConnectionManager>,
    limits: GatewayLimits,
}

impl ContextStore {
    #[must_use]
    pub fn new(
        repository: Arc<dyn ContextRepository>,
        manager: Arc<ConnectionManager>,
        limits: GatewayLimits,
    ) -> Self {
        Self { repository, manager, limits }
    }

    /// Resolve the user's connection state.
    ///
    /// No stored connection means the session expired; a missing descriptor
    /// additionally clears any stored connection, since it could never be
    /// probed again. A stored connection older than the persistence window
    /// is probed; probe failure clears the stored connection exactly once, so
    /// subsequent calls report an expired session instead of re-probing a
    /// dead pool.
    pub async fn connection_state(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
    ) -> Result<ConnectionState> {
        let mut context = self.load_or_default(user).await?;

        let Some(connection) = context.connection.clone() else {
            return Ok(ConnectionState::SessionExpired);
        };
        if !connection.connected {
            return Ok(ConnectionState::SessionExpired);
        }
        let Some(descriptor) = descriptor else {
            // No descriptor means the stored connection can never be probed
            // again; clear it so it cannot resurface as connected later
            context.connection = None;
            self.repository.save(user, &context).await?;
            return Ok(ConnectionState::SessionExpired);
        };

        let persistence = context.preferences.persistence_minutes;
        let age = Utc::now().signed_duration_since(connection.connected_at);
        let stale = persistence == 0 || age > chrono::Duration::minutes(i64::from(persistence));

        if !stale {
            return Ok(ConnectionState::Connected(connection));
        }

        match self.manager.probe(user, descriptor).await {
            Ok(()) => {
                let refreshed = ConnectionContext { connected_at: Utc::now(), ..connection };
                context.connection = Some(refreshed.clone());
                self.repository.save(user, &context).await?;
                Ok(ConnectionState::Connected(refreshed))
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "connection probe failed, clearing stored connection");
                context.connection = None;
                self.repository.save(user, &context).await?;
                Ok(ConnectionState::PoolDead)
            }
        }
    }

    /// Record a successful connection
    pub async fn record_connection(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<()> {
        let mut context = self.load_or_default(user).await?;
        context.connection = Some(ConnectionContext {
            connected: true,
            engine: descriptor.engine,
            database: descriptor.database.clone(),
            host: descriptor.host.clone(),
            remote: descriptor.remote,
            schema: descriptor.schema.clone(),
            connected_at: Utc::now(),
        });
        self.repository.save(user, &context).await
    }

    /// Drop the stored connection
    pub async fn record_disconnect(&self, user: &str) -> Result<()> {
        let mut context = self.load_or_default(user).await?;
        context.connection = None;
        self.repository.save(user, &context).await
    }

    /// Read a schema cache entry, treating entries past the TTL as absent
    /// without deleting them
    pub async fn schema(&self, user: &str, database: &str) -> Result<Option<SchemaCacheEntry>> {
        let context = self.load_or_default(user).await?;
        let Some(entry) = context.schemas.get(database) else {
            return Ok(None);
        };

        let age = Utc::now().signed_duration_since(entry.cached_at);
        let ttl = chrono::Duration::seconds(
            i64::try_from(self.limits.schema_cache_ttl_secs).unwrap_or(i64::MAX),
        );
        if age > ttl {
            return Ok(None);
        }
        Ok(Some(entry.clone()))
    }

    /// Store a fresh snapshot, returning whether its content hash differs
    /// from the previous entry
    pub async fn store_schema(&self, user: &str, snapshot: &SchemaSnapshot) -> Result<bool> {
        let mut context = self.load_or_default(user).await?;

        let hash = schema_content_hash(snapshot);
        let changed = context
            .schemas
            .get(&snapshot.database)
            .is_none_or(|previous| previous.content_hash != hash);

        context.schemas.insert(
            snapshot.database.clone(),
            SchemaCacheEntry {
                database: snapshot.database.clone(),
                tables: snapshot.tables.clone(),
                columns: snapshot.columns.clone(),
                content_hash: hash,
                cached_at: Utc::now(),
            },
        );
        self.repository.save(user, &context).await?;
        Ok(changed)
    }

    /// Delete one database's cached schema
    pub async fn invalidate_schema(&self, user: &str, database: &str) -> Result<()> {
        let mut context = self.load_or_default(user).await?;
        context.schemas.remove(database);
        self.repository.save(user, &context).await
    }

    /// Delete every cached schema for the user
    pub async fn invalidate_all_schemas(&self, user: &str) -> Result<()> {
        let mut context = self.load_or_default(user).await?;
        context.schemas.clear();
        self.repository.save(user, &context).await
    }

    /// Append a history entry, truncating the query text and evicting the
    /// oldest entry past capacity
    pub async fn record_query(
        &self,
        user: &str,
        query: &str,
        database: Option<&str>,
        row_count: usize,
        status: QueryStatus,
    ) -> Result<()> {
        let mut context = self.load_or_default(user).await?;

        let truncated: String = query.chars().take(MAX_HISTORY_QUERY_LENGTH).collect();
        context.history.push_back(QueryHistoryEntry {
            query: truncated,
            database: database.map(str::to_string),
            row_count,
            status,
            executed_at: Utc::now(),
        });
        while context.history.len() > self.limits.history_capacity {
            context.history.pop_front();
        }

        self.repository.save(user, &context).await
    }

    /// Most recent history entries, newest first
    pub async fn recent_queries(&self, user: &str, limit: usize) -> Result<Vec<QueryHistoryEntry>> {
        let context = self.load_or_default(user).await?;
        Ok(context.history.iter().rev().take(limit).cloned().collect())
    }

    pub async fn clear_query_history(&self, user: &str) -> Result<()> {
        let mut context = self.load_or_default(user).await?;
        context.history.clear();
        self.repository.save(user, &context).await
    }

    /// Update the connection persistence preference
    pub async fn set_persistence_minutes(&self, user: &str, minutes: u32) -> Result<()> {
        let mut context = self.load_or_default(user).await?;
        context.preferences.persistence_minutes = minutes;
        self.repository.save(user, &context).await
    }

    /// Connection, schemas and history in one read
    pub async fn full_context(&self, user: &str) -> Result<UserContext> {
        self.load_or_default(user).await
    }

    async fn load_or_default(&self, user: &str) -> Result<UserContext> {
        Ok(self
            .repository
            .load(user)
            .await?
            .unwrap_or_else(|| UserContext::new(self.limits.default_persistence_minutes)))
    }
}

/// Stable hash of a snapshot's tables and columns; changes iff the structure
/// changes
#[must_use]
pub fn schema_content_hash(snapshot: &SchemaSnapshot) -> u64 {
    let mut hasher = DefaultHasher::new();

    let mut tables = snapshot.tables.clone();
    tables.sort();
    tables.hash(&mut hasher);

    let mut table_names: Vec<&String> = snapshot.columns.keys().collect();
    table_names.sort();
    for table in table_names {
        table.hash(&mut hasher);
        for column in &snapshot.columns[table] {
            column.name.hash(&mut hasher);
            column.data_type.hash(&mut hasher);
            column.nullable.hash(&mut hasher);
        }
    }

    hasher.finish()
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn store_with(limits: GatewayLimits) -> ContextStore {
        ContextStore::new(
            Arc::new(InMemoryContextRepository::new()),
            Arc::new(ConnectionManager::new(limits.clone())),
            limits,
        )
    }

    fn seeded_sqlite(name: &str) -> ConnectionDescriptor {
        let path =
            std::env::temp_dir().join(format!("colloquy_ctx_{name}_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        ConnectionDescriptor::sqlite(path)
    }

    fn snapshot(tables: &[&str]) -> SchemaSnapshot {
        let mut columns = HashMap::new();
        for table in tables {
            columns.insert(
                (*table).to_string(),
                vec![ColumnDescription {
                    name: "id".to_string(),
                    data_type: "INTEGER".to_string(),
                    nullable: false,
                    default: None,
                }],
            );
        }
        SchemaSnapshot {
            database: "main".to_string(),
            tables: tables.iter().map(|t| (*t).to_string()).collect(),
            columns,
        }
    }

    #[tokio::test]
    async fn test_no_session_reports_expired() {
        let store = store_with(GatewayLimits::default());
        let state = store.connection_state("alice", None).await.unwrap();
        assert_eq!(state.as_str(), "session_expired");
    }

    #[tokio::test]
    async fn test_fresh_connection_fast_path() {
        let store = store_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("fast");

        store.record_connection("alice", &descriptor).await.unwrap();
        let state = store.connection_state("alice", Some(&descriptor)).await.unwrap();
        assert_eq!(state.as_str(), "connected");
    }

    #[tokio::test]
    async fn test_missing_descriptor_clears_stored_connection() {
        let store = store_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("no_descriptor");

        store.record_connection("alice", &descriptor).await.unwrap();
        let state = store.connection_state("alice", None).await.unwrap();
        assert_eq!(state.as_str(), "session_expired");

        // The stored connection must not resurface once the descriptor is
        // back; a fresh record_connection is required
        let state = store.connection_state("alice", Some(&descriptor)).await.unwrap();
        assert_eq!(state.as_str(), "session_expired");

        store.record_connection("alice", &descriptor).await.unwrap();
        let state = store.connection_state("alice", Some(&descriptor)).await.unwrap();
        assert_eq!(state.as_str(), "connected");
    }

    #[tokio::test]
    async fn test_zero_persistence_probes_every_time() {
        let store = store_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("probe_always");

        store.record_connection("alice", &descriptor).await.unwrap();
        store.set_persistence_minutes("alice", 0).await.unwrap();

        let state = store.connection_state("alice", Some(&descriptor)).await.unwrap();
        assert_eq!(state.as_str(), "connected");
    }

    #[tokio::test]
    async fn test_dead_pool_clears_connection_once() {
        let store = store_with(GatewayLimits::default());
        let dead = ConnectionDescriptor::sqlite(PathBuf::from("/nonexistent/dir/missing.db"));

        store.record_connection("alice", &dead).await.unwrap();
        store.set_persistence_minutes("alice", 0).await.unwrap();

        let first = store.connection_state("alice", Some(&dead)).await.unwrap();
        assert_eq!(first.as_str(), "db_pool_dead");

        // Cleared on the first failure; later calls see an expired session
        let second = store.connection_state("alice", Some(&dead)).await.unwrap();
        assert_eq!(second.as_str(), "session_expired");
    }

    #[tokio::test]
    async fn test_disconnect_expires_session() {
        let store = store_with(GatewayLimits::default());
        let descriptor = seeded_sqlite("disconnect");

        store.record_connection("alice", &descriptor).await.unwrap();
        store.record_disconnect("alice").await.unwrap();

        let state = store.connection_state("alice", Some(&descriptor)).await.unwrap();
        assert_eq!(state.as_str(), "session_expired");
    }

    #[tokio::test]
    async fn test_schema_ttl_treats_expired_as_absent() {
        let limits = GatewayLimits { schema_cache_ttl_secs: 0, ..Default::default() };
        let store = store_with(limits);

        store.store_schema("alice", &snapshot(&["orders"])).await.unwrap();

        // Zero TTL: immediately absent on read, but not deleted
        assert!(store.schema("alice", "main").await.unwrap().is_none());
        let context = store.full_context("alice").await.unwrap();
        assert!(context.schemas.contains_key("main"));
    }

    #[tokio::test]
    async fn test_schema_read_within_ttl() {
        let store = store_with(GatewayLimits::default());
        store.store_schema("alice", &snapshot(&["orders"])).await.unwrap();

        let entry = store.schema("alice", "main").await.unwrap().unwrap();
        assert_eq!(entry.tables, vec!["orders"]);
    }

    #[tokio::test]
    async fn test_invalidate_schema_deletes() {
        let store = store_with(GatewayLimits::default());
        store.store_schema("alice", &snapshot(&["orders"])).await.unwrap();
        store.invalidate_schema("alice", "main").await.unwrap();

        let context = store.full_context("alice").await.unwrap();
        assert!(context.schemas.is_empty());
    }

    #[tokio::test]
    async fn test_store_schema_reports_change() {
        let store = store_with(GatewayLimits::default());

        assert!(store.store_schema("alice", &snapshot(&["orders"])).await.unwrap());
        assert!(!store.store_schema("alice", &snapshot(&["orders"])).await.unwrap());
        assert!(store.store_schema("alice", &snapshot(&["orders", "customers"])).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_ring_caps_and_truncates() {
        let store = store_with(GatewayLimits::default());

        let long_query = format!("SELECT * FROM t WHERE x = '{}'", "a".repeat(600));
        for i in 0..12 {
            let query = if i == 11 { long_query.clone() } else { format!("SELECT {i}") };
            store
                .record_query("alice", &query, Some("main"), i, QueryStatus::Success)
                .await
                .unwrap();
        }

        let recent = store.recent_queries("alice", 20).await.unwrap();
        assert_eq!(recent.len(), 10);
        // Newest first, truncated to the cap
        assert_eq!(recent[0].query.chars().count(), MAX_HISTORY_QUERY_LENGTH);
        assert_eq!(recent[1].query, "SELECT 10");
        // The two oldest entries were evicted
        assert!(!recent.iter().any(|e| e.query == "SELECT 0"));
        assert!(!recent.iter().any(|e| e.query == "SELECT 1"));
    }

    #[tokio::test]
    async fn test_clear_query_history() {
        let store = store_with(GatewayLimits::default());
        store.record_query("alice", "SELECT 1", None, 1, QueryStatus::Success).await.unwrap();
        store.clear_query_history("alice").await.unwrap();
        assert!(store.recent_queries("alice", 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_content_hash_ignores_table_order() {
        let a = snapshot(&["orders", "customers"]);
        let b = snapshot(&["customers", "orders"]);
        assert_eq!(schema_content_hash(&a), schema_content_hash(&b));
    }

    #[test]
    fn test_content_hash_tracks_column_changes() {
        let base = snapshot(&["orders"]);
        let mut widened = snapshot(&["orders"]);
        widened.columns.get_mut("orders").unwrap().push(ColumnDescription {
            name: "total".to_string(),
            data_type: "REAL".to_string(),
            nullable: true,
            default: None,
        });
        assert_ne!(schema_content_hash(&base), schema_content_hash(&widened));
    }
}
