pub mod config;
pub mod pool;
pub mod provider;

use crate::core::{EntityId, EntityKey, PersistError, Result};
use crate::storage::{Change, EntityStore, StoredRow};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use config::ConnectionConfig;
pub use pool::{ConnectionPool, PoolStats};
use pool::PoolSlot;
pub use provider::{ConnectionProvider, PooledConnectionProvider};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Raw handle onto an [`EntityStore`].
///
/// Changes applied inside a transaction are written immediately and undone on
/// rollback. Rows they wrote stay exclusively locked by the connection's owner
/// until the transaction ends, and commit or rollback release every row lock
/// that owner holds in the store. Dropping a connection mid-transaction rolls
/// it back.
pub struct Connection {
    id: u64,
    tenant: Option<String>,
    store: Arc<EntityStore>,
    state: ConnectionState,
    /// Lock owner writes are applied for (a session id, 0 when unbound)
    owner: u64,
    /// Undo batches of the open transaction, oldest first
    undo_log: Vec<(u64, Vec<Change>)>,
    /// Pool capacity this connection occupies, freed when it is dropped
    slot: Option<PoolSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}

impl Connection {
    pub fn new(store: Arc<EntityStore>, tenant: Option<String>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tenant,
            store,
            state: ConnectionState::Active,
            owner: 0,
            undo_log: Vec::new(),
            slot: None,
        }
    }

    pub(crate) fn pooled(store: Arc<EntityStore>, tenant: Option<String>, slot: PoolSlot) -> Self {
        let mut connection = Self::new(store, tenant);
        connection.slot = Some(slot);
        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Attributes subsequent writes to `owner` for row locking.
    pub fn bind_owner(&mut self, owner: u64) {
        self.owner = owner;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(PersistError::Connection(format!(
                "connection {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    pub async fn fetch(&self, key: &EntityKey) -> Result<Option<StoredRow>> {
        self.ensure_open()?;
        Ok(self.store.fetch(key))
    }

    pub async fn exists(&self, key: &EntityKey) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.store.exists(key))
    }

    pub async fn scan(&self, entity_name: &str) -> Result<Vec<(EntityId, StoredRow)>> {
        self.ensure_open()?;
        Ok(self.store.scan(entity_name))
    }

    pub async fn count(&self, entity_name: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.store.count(entity_name))
    }

    pub async fn next_sequence(&self, entity_name: &str) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.store.next_sequence(entity_name))
    }

    /// Applies `changes` as one atomic batch on behalf of the bound owner and
    /// returns the resulting row versions in batch order.
    ///
    /// Fails with `LockUnavailable` when another owner holds a lock on a row
    /// the batch writes.
    pub async fn execute(&mut self, changes: &[Change]) -> Result<Vec<i64>> {
        self.ensure_open()?;
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let in_transaction = self.state == ConnectionState::InTransaction;
        let outcome = self.store.apply(changes, self.owner, in_transaction)?;
        if in_transaction {
            self.undo_log.push((self.owner, outcome.undo));
        }
        Ok(outcome.versions)
    }

    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;

        if self.state == ConnectionState::InTransaction {
            return Err(PersistError::IllegalState("Transaction already active".into()));
        }

        self.state = ConnectionState::InTransaction;
        self.undo_log.clear();
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(PersistError::IllegalState("No active transaction".into()));
        }

        self.state = ConnectionState::Active;
        self.undo_log.clear();
        self.store.locks().release_owner(self.owner);
        Ok(())
    }

    /// Undoes every batch executed since `begin`, newest first.
    pub async fn rollback(&mut self) -> Result<()> {
        self.rollback_now()
    }

    /// Synchronous [`Connection::rollback`], usable from `Drop`. A batch whose
    /// rows were changed again since is left alone and reported as
    /// `StaleState`.
    pub fn rollback_now(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(PersistError::IllegalState("No active transaction".into()));
        }

        self.state = ConnectionState::Active;
        let mut first_error = None;
        while let Some((owner, undo)) = self.undo_log.pop() {
            if let Err(err) = self.store.apply(&undo, owner, false) {
                log::warn!("connection {}: rollback step failed: {}", self.id, err);
                first_error.get_or_insert(err);
            }
        }
        self.store.locks().release_owner(self.owner);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Close the connection, rolling back an open transaction.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::InTransaction {
            self.rollback().await?;
        }

        self.state = ConnectionState::Closed;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("store", &self.store.name())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::InTransaction {
            return;
        }
        log::warn!(
            "connection {} dropped inside a transaction; rolling back {} batch(es)",
            self.id,
            self.undo_log.len()
        );
        if let Err(err) = self.rollback_now() {
            log::warn!("connection {}: rollback on drop failed: {}", self.id, err);
        }
    }
}
