// ============================================================================
// persistkit Library
// ============================================================================
//
// Unit-of-work persistence sessions over a versioned in-memory entity store:
// an identity map with snapshot dirty checking, lock modes, flush policies,
// replication and a second-level cache with region administration.
//
// ============================================================================

//! # Example
//!
//! ```
//! use persistkit::{Entity, EntityHandle, EntityId, SessionFactory, SessionFactoryConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Invoice {
//!     id: Option<EntityId>,
//!     amount: i64,
//! }
//!
//! impl Entity for Invoice {
//!     const ENTITY_NAME: &'static str = "Invoice";
//!
//!     fn id(&self) -> Option<EntityId> {
//!         self.id.clone()
//!     }
//!
//!     fn set_id(&mut self, id: EntityId) {
//!         self.id = Some(id);
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let factory = SessionFactory::new(SessionFactoryConfig::default()).await?;
//! let mut session = factory.open_session()?;
//!
//! let invoice = EntityHandle::new(Invoice { id: None, amount: 40 });
//! let id = session.save(&invoice).await?;
//! session.flush().await?;
//!
//! let loaded = session.get::<Invoice>(id).await?.expect("tracked");
//! assert!(loaded.same_instance(&invoice));
//! session.close().await?;
//! # Ok::<(), persistkit::PersistError>(())
//! # }).unwrap();
//! ```

pub mod cache;
pub mod connection;
pub mod core;
pub mod factory;
pub mod mode;
pub mod query;
pub mod session;
pub mod storage;

// Re-export main types for convenience
pub use cache::{Cache, CacheStats, RegionCache};
pub use connection::{
    Connection, ConnectionConfig, ConnectionPool, ConnectionProvider, PoolStats,
    PooledConnectionProvider,
};
pub use crate::core::{
    CascadeAction, Entity, EntityHandle, EntityId, EntityKey, IdStrategy, PersistError, Result,
};
pub use factory::{
    SessionBuilder, SessionContext, SessionFactory, SessionFactoryBuilder, SessionFactoryConfig,
    Statistics,
};
pub use mode::{CacheMode, FlushMode, LockMode, LockOptions, LockTimeout, ReplicationMode};
pub use query::Query;
pub use session::{LockRequest, ReturningWork, Session, SessionStatistics, Work};
pub use storage::{EntityStore, StoredRow};
