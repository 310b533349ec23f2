use super::{Connection, ConnectionConfig, ConnectionPool, PoolStats};
use crate::core::{PersistError, Result};
use crate::storage::EntityStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Source of raw connections for sessions.
///
/// `get_any_connection` serves tenant-agnostic work; `get_connection` returns
/// a connection bound to one tenant's store. Every connection obtained must be
/// handed back through the matching release call.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn get_any_connection(&self) -> Result<Connection>;

    async fn release_any_connection(&self, connection: Connection) -> Result<()>;

    async fn get_connection(&self, tenant: &str) -> Result<Connection>;

    async fn release_connection(&self, tenant: &str, connection: Connection) -> Result<()>;

    /// Statistics per pool, the tenant-agnostic pool under `None`.
    async fn pool_stats(&self) -> Vec<(Option<String>, PoolStats)> {
        Vec::new()
    }

    /// Releases pooled resources. Called once by the owning factory.
    async fn close(&self) {}
}

/// Provider backed by one [`ConnectionPool`] per tenant plus a default pool.
///
/// Each tenant gets its own store; tenant pools are created on first use.
pub struct PooledConnectionProvider {
    config: ConnectionConfig,
    default_pool: ConnectionPool,
    tenants: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl PooledConnectionProvider {
    pub async fn new(config: ConnectionConfig) -> Result<Self> {
        let default_pool = ConnectionPool::new_isolated(config.clone()).await?;
        Ok(Self {
            config,
            default_pool,
            tenants: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the default pool over an existing store.
    pub async fn with_store(config: ConnectionConfig, store: Arc<EntityStore>) -> Result<Self> {
        let default_pool = ConnectionPool::new(config.clone(), store, None).await?;
        Ok(Self {
            config,
            default_pool,
            tenants: Mutex::new(HashMap::new()),
        })
    }

    pub fn default_store(&self) -> &Arc<EntityStore> {
        self.default_pool.store()
    }

    async fn tenant_pool(&self, tenant: &str) -> Result<Arc<ConnectionPool>> {
        if tenant.is_empty() {
            return Err(PersistError::Connection("tenant identifier is empty".into()));
        }

        let mut tenants = self.tenants.lock().await;
        if let Some(pool) = tenants.get(tenant) {
            return Ok(Arc::clone(pool));
        }
        if self.default_pool.is_closed() {
            return Err(PersistError::Connection("Connection provider is closed".into()));
        }

        let store = Arc::new(EntityStore::new(format!(
            "{}/{}",
            self.config.database, tenant
        )));
        let pool = Arc::new(
            ConnectionPool::new(self.config.clone(), store, Some(tenant.to_string())).await?,
        );
        log::debug!("Created pool for tenant '{}'", tenant);
        tenants.insert(tenant.to_string(), Arc::clone(&pool));
        Ok(pool)
    }
}

#[async_trait]
impl ConnectionProvider for PooledConnectionProvider {
    async fn get_any_connection(&self) -> Result<Connection> {
        self.default_pool.acquire().await
    }

    async fn release_any_connection(&self, connection: Connection) -> Result<()> {
        self.default_pool.release(connection).await
    }

    async fn get_connection(&self, tenant: &str) -> Result<Connection> {
        self.tenant_pool(tenant).await?.acquire().await
    }

    async fn release_connection(&self, tenant: &str, connection: Connection) -> Result<()> {
        if connection.tenant() != Some(tenant) {
            return Err(PersistError::Connection(format!(
                "connection {} does not belong to tenant '{}'",
                connection.id(),
                tenant
            )));
        }
        self.tenant_pool(tenant).await?.release(connection).await
    }

    async fn pool_stats(&self) -> Vec<(Option<String>, PoolStats)> {
        let mut stats = vec![(None, self.default_pool.stats().await)];
        let tenants = self.tenants.lock().await;
        let mut names: Vec<_> = tenants.keys().cloned().collect();
        names.sort();
        for name in names {
            if let Some(pool) = tenants.get(&name) {
                stats.push((Some(name.clone()), pool.stats().await));
            }
        }
        stats
    }

    async fn close(&self) {
        self.default_pool.close().await;
        let tenants = self.tenants.lock().await;
        for pool in tenants.values() {
            pool.close().await;
        }
    }
}
