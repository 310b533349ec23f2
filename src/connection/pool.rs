use super::{Connection, config::ConnectionConfig};
use crate::core::{PersistError, Result};
use crate::storage::EntityStore;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Connection pool
///
/// Hands out owned [`Connection`]s onto one store. Callers give them back with
/// [`ConnectionPool::release`]; a connection that is dropped instead frees its
/// slot without returning to the idle queue.
pub struct ConnectionPool {
    /// Pool configuration
    config: ConnectionConfig,
    /// Tenant every connection of this pool is bound to
    tenant: Option<String>,
    /// Shared store
    store: Arc<EntityStore>,
    /// Available connections
    available: Mutex<VecDeque<PooledConnection>>,
    /// Connections created and not yet dropped
    total_connections: Arc<AtomicUsize>,
    /// Successful acquisitions
    acquired: AtomicUsize,
    closed: AtomicBool,
}

/// Counts one connection against `max_connections` for as long as it lives.
#[derive(Debug)]
pub(crate) struct PoolSlot {
    total: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection from the pool
struct PooledConnection {
    connection: Connection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Connection) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }
}

impl ConnectionPool {
    /// Create a pool over `store`, pre-creating `min_connections`.
    pub async fn new(
        config: ConnectionConfig,
        store: Arc<EntityStore>,
        tenant: Option<String>,
    ) -> Result<Self> {
        config.validate().map_err(PersistError::Config)?;

        let pool = Self {
            config,
            tenant,
            store,
            available: Mutex::new(VecDeque::new()),
            total_connections: Arc::new(AtomicUsize::new(0)),
            acquired: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };

        pool.ensure_min_connections().await;

        Ok(pool)
    }

    /// Create a pool with its own empty store
    ///
    /// Useful for testing to ensure tests don't interfere with each other.
    pub async fn new_isolated(config: ConnectionConfig) -> Result<Self> {
        let store = Arc::new(EntityStore::new(config.database.clone()));
        Self::new(config, store, None).await
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Get a connection from the pool, waiting up to `connect_timeout`.
    pub async fn acquire(&self) -> Result<Connection> {
        let start = Instant::now();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PersistError::Connection("Connection pool is closed".into()));
            }

            if let Some(pooled) = self.try_get_available().await {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(pooled.connection);
            }

            if let Some(conn) = self.try_create_connection() {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }

            if start.elapsed() > self.config.connect_timeout {
                return Err(PersistError::Connection(
                    "Connection pool timeout: no connections available".into(),
                ));
            }

            // Wait a bit before retrying
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Return a connection. Closed connections and connections given back
    /// after the pool closed are discarded; an open transaction is rolled back.
    pub async fn release(&self, mut connection: Connection) -> Result<()> {
        if connection.is_in_transaction() {
            warn!(
                "Connection {} returned with an open transaction; rolling back",
                connection.id()
            );
            connection.rollback().await?;
        }

        if !connection.is_active() || self.closed.load(Ordering::SeqCst) {
            connection.close().await?;
            debug!("Discarded connection {}", connection.id());
            return Ok(());
        }

        let mut available = self.available.lock().await;
        available.push_back(PooledConnection::new(connection));
        Ok(())
    }

    /// Try to get an available connection from the pool
    async fn try_get_available(&self) -> Option<PooledConnection> {
        let mut available = self.available.lock().await;

        let mut kept = VecDeque::with_capacity(available.len());
        let mut removed = 0usize;
        while let Some(pooled) = available.pop_front() {
            if pooled.is_expired(self.config.max_lifetime)
                || pooled.is_idle_too_long(self.config.idle_timeout)
            {
                removed += 1;
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;

        if removed > 0 {
            debug!("Pruned {} stale connection(s)", removed);
        }

        available.pop_front()
    }

    /// Try to create a new connection if under limit
    fn try_create_connection(&self) -> Option<Connection> {
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.config.max_connections).then_some(total + 1)
            });

        reserved.ok().map(|_| {
            let connection = self.open_connection();
            debug!("Opened connection {} on '{}'", connection.id(), self.store.name());
            connection
        })
    }

    /// Opens a connection whose slot is already counted in `total_connections`.
    fn open_connection(&self) -> Connection {
        let slot = PoolSlot {
            total: Arc::clone(&self.total_connections),
        };
        Connection::pooled(Arc::clone(&self.store), self.tenant.clone(), slot)
    }

    /// Ensure minimum number of connections
    async fn ensure_min_connections(&self) {
        let mut available = self.available.lock().await;

        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            self.total_connections.fetch_add(1, Ordering::SeqCst);
            available.push_back(PooledConnection::new(self.open_connection()));
        }
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
            acquired_total: self.acquired.load(Ordering::Relaxed),
        }
    }

    /// Close the pool. Idle connections are discarded now, leased ones when
    /// they are released.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut available = self.available.lock().await;
        let drained = available.len();
        for mut pooled in available.drain(..) {
            if let Err(err) = pooled.connection.close().await {
                warn!("Failed to close connection {}: {}", pooled.connection.id(), err);
            }
        }
        debug!("Closed pool on '{}' ({} idle connection(s))", self.store.name(), drained);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
    pub acquired_total: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}, {} acquired",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections,
            self.acquired_total
        )
    }
}
