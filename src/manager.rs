//! Connection Manager
//!
//! Per-user registry of live pools, keyed by user id and guarded by the
//! descriptor fingerprint. A user holds at most one pool: switching to a
//! different descriptor closes the previous pool before the new one is
//! created.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::GatewayLimits;
use crate::engine::{dialect_for, ConnectionDescriptor, PoolHandle, PooledConn};
use crate::error::Result;

/// One user's live pool and the descriptor it was built from
pub struct PoolEntry {
    pub descriptor: ConnectionDescriptor,
    pub handle: Arc<PoolHandle>,
    pub last_validated: Instant,
}

/// Registry of per-user pools
///
/// Shared across requests; all methods take `&self`.
pub struct ConnectionManager {
    pools: DashMap<String, PoolEntry>,
    limits: GatewayLimits,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(limits: GatewayLimits) -> Self {
        Self { pools: DashMap::new(), limits }
    }

    /// Check a connection out of the user's pool, creating the pool lazily.
    ///
    /// A prior pool with a different fingerprint is closed first, exactly
    /// once, before the replacement is built.
    pub async fn acquire(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<PooledConn> {
        let handle = self.pool_for(user, descriptor).await?;
        handle.acquire().await
    }

    /// Run the engine's liveness probe over a pooled connection, refreshing
    /// the entry's validation timestamp on success
    pub async fn probe(&self, user: &str, descriptor: &ConnectionDescriptor) -> Result<()> {
        let mut conn = self.acquire(user, descriptor).await?;
        conn.probe(dialect_for(descriptor.engine)).await?;

        if let Some(mut entry) = self.pools.get_mut(user) {
            entry.last_validated = Instant::now();
        }
        Ok(())
    }

    /// Close and remove the user's pool. Returns whether a pool was actually
    /// closed; calling again is a no-op.
    pub async fn close_pool(&self, user: &str) -> Result<bool> {
        match self.pools.remove(user) {
            Some((_, entry)) => {
                entry.handle.close().await?;
                tracing::info!(user, engine = %entry.descriptor.engine, "closed connection pool");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Descriptor of the user's current pool, if any
    #[must_use]
    pub fn active_descriptor(&self, user: &str) -> Option<ConnectionDescriptor> {
        self.pools.get(user).map(|entry| entry.descriptor.clone())
    }

    /// Number of live pools
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    async fn pool_for(
        &self,
        user: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<PoolHandle>> {
        let fingerprint = descriptor.fingerprint();

        // The map guard must not be held across an await; decide, drop, act.
        let stale = match self.pools.get(user) {
            Some(entry) if entry.descriptor.fingerprint() == fingerprint => {
                return Ok(Arc::clone(&entry.handle));
            }
            Some(_) => true,
            None => false,
        };

        if stale {
            if let Some((_, previous)) = self.pools.remove(user) {
                tracing::info!(
                    user,
                    engine = %previous.descriptor.engine,
                    "closing previous pool before descriptor switch"
                );
                if let Err(e) = previous.handle.close().await {
                    tracing::warn!(user, error = %e, "failed to close previous pool");
                }
            }
        }

        let handle = Arc::new(PoolHandle::create(descriptor, &self.limits).await?);

        // Two tasks can race past the lookup above and each build a pool.
        // Resolve through the entry so exactly one pool survives per user,
        // and close the loser outside the map guard.
        let (winner, displaced) = match self.pools.entry(user.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().descriptor.fingerprint() == fingerprint {
                    (Arc::clone(&occupied.get().handle), Some(handle))
                } else {
                    let previous = occupied.insert(PoolEntry {
                        descriptor: descriptor.clone(),
                        handle: Arc::clone(&handle),
                        last_validated: Instant::now(),
                    });
                    (handle, Some(previous.handle))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PoolEntry {
                    descriptor: descriptor.clone(),
                    handle: Arc::clone(&handle),
                    last_validated: Instant::now(),
                });
                (handle, None)
            }
        };

        if let Some(loser) = displaced {
            if let Err(e) = loser.close().await {
                tracing::warn!(user, error = %e, "failed to close displaced pool");
            }
        }

        Ok(winner)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn seeded_sqlite(name: &str) -> ConnectionDescriptor {
        let path = std::env::temp_dir()
            .join(format!("colloquy_manager_{name}_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        ConnectionDescriptor::sqlite(path)
    }

    #[tokio::test]
    async fn test_acquire_creates_pool_lazily() {
        let manager = ConnectionManager::new(GatewayLimits::default());
        assert_eq!(manager.pool_count(), 0);

        let descriptor = seeded_sqlite("lazy");
        let mut conn = manager.acquire("alice", &descriptor).await.unwrap();
        assert_eq!(manager.pool_count(), 1);

        let rows = conn.fetch("SELECT COUNT(*) AS n FROM t").await.unwrap();
        assert_eq!(rows.rows[0][0], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_switch_replaces_pool() {
        let manager = ConnectionManager::new(GatewayLimits::default());

        let first = seeded_sqlite("switch_a");
        let second = seeded_sqlite("switch_b");

        manager.acquire("alice", &first).await.unwrap();
        manager.acquire("alice", &second).await.unwrap();

        assert_eq!(manager.pool_count(), 1);
        let active = manager.active_descriptor("alice").unwrap();
        assert_eq!(active.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn test_pools_are_per_user() {
        let manager = ConnectionManager::new(GatewayLimits::default());
        let descriptor = seeded_sqlite("per_user");

        manager.acquire("alice", &descriptor).await.unwrap();
        manager.acquire("bob", &descriptor).await.unwrap();
        assert_eq!(manager.pool_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_acquires_share_one_pool() {
        let manager = Arc::new(ConnectionManager::new(GatewayLimits::default()));
        let descriptor = seeded_sqlite("race");

        let a = {
            let manager = Arc::clone(&manager);
            let descriptor = descriptor.clone();
            tokio::spawn(async move { manager.acquire("alice", &descriptor).await })
        };
        let b = {
            let manager = Arc::clone(&manager);
            let descriptor = descriptor.clone();
            tokio::spawn(async move { manager.acquire("alice", &descriptor).await })
        };

        let (a, b) = tokio::join!(a, b);
        a.unwrap().unwrap();
        b.unwrap().unwrap();
        assert_eq!(manager.pool_count(), 1);

        // The surviving pool still hands out working connections
        let mut conn = manager.acquire("alice", &descriptor).await.unwrap();
        let rows = conn.fetch("SELECT COUNT(*) AS n FROM t").await.unwrap();
        assert_eq!(rows.rows[0][0], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_close_pool_is_idempotent() {
        let manager = ConnectionManager::new(GatewayLimits::default());
        let descriptor = seeded_sqlite("close");

        manager.acquire("alice", &descriptor).await.unwrap();
        assert!(manager.close_pool("alice").await.unwrap());
        assert!(!manager.close_pool("alice").await.unwrap());
        assert_eq!(manager.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_succeeds_on_live_database() {
        let manager = ConnectionManager::new(GatewayLimits::default());
        let descriptor = seeded_sqlite("probe_ok");
        assert!(manager.probe("alice", &descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_fails_on_missing_file() {
        let manager = ConnectionManager::new(GatewayLimits::default());
        let descriptor =
            ConnectionDescriptor::sqlite(PathBuf::from("/nonexistent/dir/missing.db"));
        assert!(manager.probe("alice", &descriptor).await.is_err());
    }
}
