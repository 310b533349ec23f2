//! Session factory: owns the cache, the connection provider and statistics,
//! and opens sessions configured from its defaults.

pub mod config;
mod statistics;

pub use config::SessionFactoryConfig;
pub(crate) use statistics::StatisticsCounters;
pub use statistics::Statistics;

use crate::cache::{Cache, RegionCache};
use crate::connection::{Connection, ConnectionProvider, PoolStats, PooledConnectionProvider};
use crate::core::{PersistError, Result};
use crate::mode::{CacheMode, FlushMode};
use crate::session::{Session, SessionOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{Level, event};

pub(crate) struct FactoryInner {
    pub(crate) config: SessionFactoryConfig,
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) statistics: StatisticsCounters,
    closed: AtomicBool,
    next_session_id: AtomicU64,
}

/// Shared, cloneable handle to a factory. Clones refer to the same factory.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl SessionFactory {
    /// Factory with the default pooled provider and an in-memory region cache.
    pub async fn new(config: SessionFactoryConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: SessionFactoryConfig) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            config,
            provider: None,
            cache: None,
        }
    }

    pub(crate) fn inner(&self) -> &FactoryInner {
        &self.inner
    }

    pub fn config(&self) -> &SessionFactoryConfig {
        &self.inner.config
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.inner.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn same_factory(&self, other: &SessionFactory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PersistError::FactoryClosed);
        }
        Ok(())
    }

    /// Opens a session with the factory defaults.
    pub fn open_session(&self) -> Result<Session> {
        self.with_options().open()
    }

    /// Starts a session builder for per-session settings.
    pub fn with_options(&self) -> SessionBuilder {
        let config = &self.inner.config;
        SessionBuilder {
            factory: self.clone(),
            options: SessionOptions {
                connection: None,
                tenant: None,
                flush_mode: config.flush_mode,
                cache_mode: config.cache_mode,
                default_read_only: config.default_read_only,
            },
        }
    }

    /// Returns the session bound to `context`, opening one if the context holds
    /// none, holds a closed one, or holds one from another factory.
    pub fn current_session<'c>(&self, context: &'c mut SessionContext) -> Result<&'c mut Session> {
        self.ensure_open()?;

        let reusable = context
            .session
            .as_ref()
            .is_some_and(|session| session.is_open() && session.factory().same_factory(self));
        if !reusable {
            context.session = Some(self.open_session()?);
        }

        context.session.as_mut().ok_or_else(|| {
            PersistError::InternalInvariant("session context is empty after binding".into())
        })
    }

    /// The administrative path to the second-level cache.
    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.inner.cache)
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.statistics.snapshot()
    }

    pub async fn pool_stats(&self) -> Vec<(Option<String>, PoolStats)> {
        self.inner.provider.pool_stats().await
    }

    /// Closes the factory and its provider. Calling it again does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.provider.close().await;
        event!(Level::INFO, "session factory closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("closed", &self.is_closed())
            .field("config", &self.inner.config)
            .finish()
    }
}

pub struct SessionFactoryBuilder {
    config: SessionFactoryConfig,
    provider: Option<Arc<dyn ConnectionProvider>>,
    cache: Option<Arc<dyn Cache>>,
}

impl SessionFactoryBuilder {
    pub fn provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn build(self) -> Result<SessionFactory> {
        self.config.validate().map_err(PersistError::Config)?;

        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(PooledConnectionProvider::new(self.config.connection.clone()).await?),
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(RegionCache::new(self.config.cache_region_capacity)),
        };

        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                config: self.config,
                provider,
                cache,
                statistics: StatisticsCounters::default(),
                closed: AtomicBool::new(false),
                next_session_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Per-session settings that override the factory defaults.
pub struct SessionBuilder {
    factory: SessionFactory,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Runs the session on a caller-owned connection, which enables
    /// `disconnect` and `reconnect`.
    pub fn connection(mut self, connection: Connection) -> Self {
        self.options.connection = Some(connection);
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.options.tenant = Some(tenant.into());
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.options.flush_mode = mode;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.options.cache_mode = mode;
        self
    }

    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.options.default_read_only = read_only;
        self
    }

    pub fn open(self) -> Result<Session> {
        self.factory.ensure_open()?;
        let session = Session::open(self.factory.clone(), self.options);
        StatisticsCounters::bump(&self.factory.inner.statistics.sessions_opened);
        Ok(session)
    }
}

/// Explicit holder of the "current" session of a unit of work.
#[derive(Default)]
pub struct SessionContext {
    session: Option<Session>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Unbinds and returns the current session.
    pub fn take(&mut self) -> Option<Session> {
        self.session.take()
    }

    /// Closes and unbinds the current session, if any.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            if session.is_open() {
                session.close().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_session_uses_defaults() {
        let config = SessionFactoryConfig::new()
            .flush_mode(FlushMode::Commit)
            .default_read_only(true);
        let factory = SessionFactory::new(config).await.unwrap();

        let session = factory.open_session().unwrap();
        assert_eq!(session.flush_mode(), FlushMode::Commit);
        assert!(session.is_default_read_only());
        assert_eq!(factory.statistics().sessions_opened, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_guards_open() {
        let factory = SessionFactory::new(SessionFactoryConfig::default()).await.unwrap();

        factory.close().await.unwrap();
        factory.close().await.unwrap();
        assert!(factory.is_closed());

        assert!(matches!(factory.open_session(), Err(PersistError::FactoryClosed)));
        let mut context = SessionContext::new();
        assert!(matches!(
            factory.current_session(&mut context),
            Err(PersistError::FactoryClosed)
        ));
    }

    #[tokio::test]
    async fn test_current_session_is_reused_until_closed() {
        let factory = SessionFactory::new(SessionFactoryConfig::default()).await.unwrap();
        let mut context = SessionContext::new();

        let first = factory.current_session(&mut context).unwrap().id();
        let second = factory.current_session(&mut context).unwrap().id();
        assert_eq!(first, second);

        factory.current_session(&mut context).unwrap().close().await.unwrap();
        let third = factory.current_session(&mut context).unwrap().id();
        assert_ne!(first, third);

        context.close().await.unwrap();
        assert!(!context.has_session());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = SessionFactoryConfig::new().cache_region_capacity(0);
        assert!(matches!(
            SessionFactory::new(config).await,
            Err(PersistError::Config(_))
        ));
    }
}
