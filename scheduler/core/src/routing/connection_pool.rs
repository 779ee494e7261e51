//! Connection Pool Management
//!
//! Fixed-size pools of engine connections, one pool per backend:
//! - Connections are opened once at startup and never closed afterwards
//! - At most one in-flight request per connection
//! - Health checking and metrics per pool
//!
//! # Design
//!
//! Idle connections live in a map keyed by their index, so "the first idle
//! connection" is always the lowest index. Only the idle-set mutation is
//! serialized; the RPC itself runs on a checked-out connection outside any
//! lock.
//!
//! The scheduler pairs each pool with its backend's request queue through
//! [`ConnectionPool::acquire_for`] and [`ConnectionPool::release_or_handoff`],
//! which pop the queue while the pool lock is held. A freed connection is
//! therefore handed straight to the next waiting request, and a request is
//! never left queued while a connection sits idle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::engine::{EngineConnector, EngineTransport};
use crate::error::{RequestError, SchedulerError};

// ============================================================================
// Connection Types
// ============================================================================

/// Statistics for a connection pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of connections in the pool
    pub connections: usize,
    /// Connections currently idle
    pub idle_connections: usize,
    /// Connections checked out through `acquire`
    pub checkouts: u64,
    /// Connections passed directly from one request to the next
    pub handoffs: u64,
    /// Health checks that reported an unreachable engine
    pub health_check_failures: u64,
}

/// One long-lived connection to an engine process
pub struct EngineConnection {
    /// Backend this connection belongs to
    backend: String,
    /// Position within the backend's pool
    index: usize,
    /// RPC stub
    transport: Arc<dyn EngineTransport>,
    /// Whether a request is bound to the connection
    busy: bool,
    /// Number of requests executed on this connection
    requests_handled: u64,
}

impl EngineConnection {
    /// Wrap an opened transport
    pub fn new(backend: impl Into<String>, index: usize, transport: Arc<dyn EngineTransport>) -> Self {
        Self {
            backend: backend.into(),
            index,
            transport,
            busy: false,
            requests_handled: 0,
        }
    }

    /// Backend name
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Index within the pool
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// RPC stub of this connection
    #[must_use]
    pub fn transport(&self) -> Arc<dyn EngineTransport> {
        self.transport.clone()
    }

    /// Whether a request is bound to the connection
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Number of requests executed on this connection
    #[must_use]
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }

    /// Record a finished request
    pub fn touch(&mut self) {
        self.requests_handled += 1;
    }
}

impl fmt::Debug for EngineConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConnection")
            .field("backend", &self.backend)
            .field("index", &self.index)
            .field("busy", &self.busy)
            .field("requests_handled", &self.requests_handled)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A fixed set of connections for a single backend
pub struct ConnectionPool {
    /// Backend name
    backend: String,
    /// Number of connections owned by the pool
    size: usize,
    /// Idle connections by index
    idle: Mutex<BTreeMap<usize, EngineConnection>>,
    /// Statistics
    stats: PoolStatsAtomic,
}

/// Atomic statistics for lock-free updates
#[derive(Default)]
struct PoolStatsAtomic {
    checkouts: AtomicU64,
    handoffs: AtomicU64,
    health_check_failures: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool from already opened connections
    pub fn new(backend: impl Into<String>, connections: Vec<EngineConnection>) -> Self {
        let size = connections.len();
        Self {
            backend: backend.into(),
            size,
            idle: Mutex::new(connections.into_iter().map(|c| (c.index, c)).collect()),
            stats: PoolStatsAtomic::default(),
        }
    }

    /// Open `size` connections to `backend`
    ///
    /// # Errors
    ///
    /// Fails with [`SchedulerError::Configuration`] for an empty pool and
    /// with [`SchedulerError::Connect`] if any connection cannot be opened.
    pub async fn open(
        backend: &str,
        size: usize,
        connector: &dyn EngineConnector,
    ) -> Result<Self, SchedulerError> {
        if size == 0 {
            return Err(SchedulerError::Configuration(format!(
                "backend '{backend}' must have at least one connection"
            )));
        }

        let mut connections = Vec::with_capacity(size);
        for index in 0..size {
            let transport =
                connector
                    .connect(backend, index)
                    .await
                    .map_err(|source| SchedulerError::Connect {
                        backend: backend.to_string(),
                        index,
                        source,
                    })?;
            connections.push(EngineConnection::new(backend, index, transport));
        }

        tracing::debug!(backend, size, "Opened connection pool");
        Ok(Self::new(backend, connections))
    }

    /// Backend name
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Number of connections owned by the pool
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle connections
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Get current pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self.size,
            idle_connections: self.idle_count(),
            checkouts: self.stats.checkouts.load(Ordering::Relaxed),
            handoffs: self.stats.handoffs.load(Ordering::Relaxed),
            health_check_failures: self.stats.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Check out the first idle connection together with the next piece of
    /// work from `next`
    ///
    /// `next` runs under the pool lock and is only called when a connection is
    /// idle. Returns `None` if no connection is idle or `next` yields nothing;
    /// in both cases the idle set is unchanged.
    pub(crate) fn acquire_for<T>(
        &self,
        next: impl FnOnce() -> Option<T>,
    ) -> Option<(EngineConnection, T)> {
        let mut idle = self.idle.lock();
        let (&index, _) = idle.first_key_value()?;
        let work = next()?;
        let conn = idle.remove(&index)?;
        Some((self.check_out(conn), work))
    }

    /// Hand `conn` to the next piece of work from `next`, or return it to the
    /// idle set if there is none
    ///
    /// `next` runs under the pool lock, so there is no window in which the
    /// connection is idle while work is waiting.
    pub(crate) fn release_or_handoff<T>(
        &self,
        mut conn: EngineConnection,
        next: impl FnOnce() -> Option<T>,
    ) -> Option<(EngineConnection, T)> {
        let mut idle = self.idle.lock();
        if let Some(work) = next() {
            self.stats.handoffs.fetch_add(1, Ordering::Relaxed);
            return Some((conn, work));
        }
        conn.busy = false;
        idle.insert(conn.index, conn);
        None
    }

    fn check_out(&self, mut conn: EngineConnection) -> EngineConnection {
        conn.busy = true;
        self.stats.checkouts.fetch_add(1, Ordering::Relaxed);
        conn
    }

    /// Run health checks on the idle connections
    ///
    /// Busy connections are skipped. Returns `true` if every checked
    /// connection answered.
    pub async fn health_check(&self) -> bool {
        let targets: Vec<(usize, Arc<dyn EngineTransport>)> = self
            .idle
            .lock()
            .values()
            .map(|c| (c.index, c.transport()))
            .collect();

        let mut results = Vec::with_capacity(targets.len());
        for (index, transport) in targets {
            results.push((index, transport.health_check().await));
        }

        let mut all_healthy = true;
        for (index, healthy) in results {
            if !healthy {
                all_healthy = false;
                self.stats
                    .health_check_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(backend = %self.backend, connection = index, "Engine health check failed");
            }
        }
        all_healthy
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.backend)
            .field("size", &self.size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

// ============================================================================
// Pool Manager
// ============================================================================

/// Connection pools for all backends
#[derive(Debug, Default)]
pub struct PoolManager {
    /// Pools by backend name
    pools: HashMap<String, Arc<ConnectionPool>>,
}

impl PoolManager {
    /// Create an empty pool manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the pools of every configured backend
    ///
    /// # Errors
    ///
    /// Propagates the first [`ConnectionPool::open`] failure.
    pub async fn open(
        config: &SchedulerConfig,
        connector: &dyn EngineConnector,
    ) -> Result<Self, SchedulerError> {
        let mut manager = Self::new();
        for (name, settings) in &config.backends {
            let pool = ConnectionPool::open(name, config.pool_size(settings), connector).await?;
            manager.insert(pool);
        }
        Ok(manager)
    }

    /// Add a pool, replacing any pool of the same backend
    pub fn insert(&mut self, pool: ConnectionPool) -> Arc<ConnectionPool> {
        let pool = Arc::new(pool);
        self.pools.insert(pool.backend().to_string(), pool.clone());
        pool
    }

    /// Pool of `backend`
    #[must_use]
    pub fn get(&self, backend: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(backend).cloned()
    }

    /// Names of all backends with a pool, sorted
    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get stats for all pools
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Run health checks on all pools
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, pool) in &self.pools {
            results.insert(name.clone(), pool.health_check().await);
        }
        results
    }
}

/// Configuration error for a backend without connections
pub(crate) fn no_connections(backend: &str) -> RequestError {
    RequestError::configuration(format!(
        "No connections are configured for backend '{backend}'"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::error::ErrorKind;

    fn acquire(pool: &ConnectionPool) -> Option<EngineConnection> {
        pool.acquire_for(|| Some(())).map(|(conn, ())| conn)
    }

    fn release(pool: &ConnectionPool, conn: EngineConnection) {
        assert!(pool.release_or_handoff(conn, || None::<()>).is_none());
    }

    fn pool(size: usize) -> ConnectionPool {
        let engine = MockEngine::new();
        let connections = (0..size)
            .map(|i| EngineConnection::new("reveaal", i, Arc::new(engine.clone())))
            .collect();
        ConnectionPool::new("reveaal", connections)
    }

    #[test]
    fn test_acquire_returns_lowest_idle_index() {
        let pool = pool(3);
        let first = acquire(&pool).unwrap();
        let second = acquire(&pool).unwrap();
        assert_eq!((first.index(), second.index()), (0, 1));
        assert!(first.is_busy());

        release(&pool, first);
        let again = acquire(&pool).unwrap();
        assert_eq!(again.index(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_acquire_blocks_when_exhausted() {
        let pool = pool(1);
        let conn = acquire(&pool).unwrap();
        assert!(acquire(&pool).is_none());
        release(&pool, conn);
        assert!(acquire(&pool).is_some());
    }

    #[test]
    fn test_acquire_for_leaves_idle_set_without_work() {
        let pool = pool(2);
        assert!(pool.acquire_for(|| None::<u32>).is_none());
        assert_eq!(pool.idle_count(), 2);

        let (conn, work) = pool.acquire_for(|| Some(7)).unwrap();
        assert_eq!((conn.index(), work), (0, 7));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_acquire_for_does_not_pull_work_without_connection() {
        let pool = pool(1);
        let _held = acquire(&pool).unwrap();
        let mut pulled = false;
        assert!(pool
            .acquire_for(|| {
                pulled = true;
                Some(1)
            })
            .is_none());
        assert!(!pulled);
    }

    #[test]
    fn test_release_hands_off_to_waiting_work() {
        let pool = pool(1);
        let conn = acquire(&pool).unwrap();

        let (conn, work) = pool.release_or_handoff(conn, || Some("next")).unwrap();
        assert_eq!(work, "next");
        assert!(conn.is_busy());
        assert_eq!(pool.idle_count(), 0);

        assert!(pool.release_or_handoff(conn, || None::<&str>).is_none());
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.stats().handoffs, 1);
        assert_eq!(pool.stats().checkouts, 1);
    }

    #[test]
    fn test_touch_counts_requests() {
        let pool = pool(1);
        let mut conn = acquire(&pool).unwrap();
        conn.touch();
        conn.touch();
        assert_eq!(conn.requests_handled(), 2);
    }

    #[tokio::test]
    async fn test_open_uses_connector() {
        let engine = MockEngine::new();
        let pool = ConnectionPool::open("reveaal", 3, &engine).await.unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(engine.connections().len(), 3);
    }

    #[tokio::test]
    async fn test_open_rejects_empty_pool() {
        let engine = MockEngine::new();
        let err = ConnectionPool::open("reveaal", 0, &engine).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_open_reports_connect_failure() {
        let engine = MockEngine::new();
        engine.refuse_backend("reveaal");
        let err = ConnectionPool::open("reveaal", 2, &engine).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Connect { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_health_check_counts_failures() {
        let engine = MockEngine::new();
        let pool = ConnectionPool::open("reveaal", 2, &engine).await.unwrap();
        assert!(pool.health_check().await);

        engine.set_healthy(false);
        let _busy = acquire(&pool).unwrap();
        assert!(!pool.health_check().await);
        assert_eq!(pool.stats().health_check_failures, 1);
    }

    #[tokio::test]
    async fn test_manager_opens_configured_backends() {
        let engine = MockEngine::new();
        let config = SchedulerConfig::default().with_backend("reveaal", 2);
        let manager = PoolManager::open(&config, &engine).await.unwrap();

        assert!(manager.get("reveaal").is_some());
        assert!(manager.get("j-ecdar").is_none());
        assert_eq!(no_connections("j-ecdar").kind(), ErrorKind::Configuration);
        assert_eq!(manager.backends(), vec!["reveaal"]);
        assert_eq!(manager.all_stats()["reveaal"].connections, 2);
    }
}
