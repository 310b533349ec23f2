//! The unit of work.
//!
//! A [`Session`] tracks the entity instances it has loaded or saved in an
//! identity map (at most one instance per [`EntityKey`]), detects their
//! changes against snapshots and synchronizes them with the store when it
//! flushes. It consults its [`CacheMode`] before touching the second-level
//! cache and its [`FlushMode`] before synchronizing.
//!
//! Sessions are single-owner: every operation takes `&mut self`.

mod entry;
mod flush;
mod load;
mod lock_request;
mod query;
mod work;
mod write;

pub use lock_request::LockRequest;
pub use work::{ReturningWork, Work};

use crate::cache::{CachedEntity, collection_role};
use crate::connection::Connection;
use crate::core::{
    CascadeAction, Entity, EntityHandle, EntityKey, ManagedState, PersistError, Result,
};
use crate::factory::{SessionFactory, StatisticsCounters};
use crate::mode::{CacheMode, FlushMode, LockMode};
use crate::storage::EntityStore;
use entry::{EntityEntry, EntryStatus};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

pub(crate) struct SessionOptions {
    pub connection: Option<Connection>,
    pub tenant: Option<String>,
    pub flush_mode: FlushMode,
    pub cache_mode: CacheMode,
    pub default_read_only: bool,
}

/// Entity count and keys of a session's persistence context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatistics {
    pub entity_count: usize,
    pub entity_keys: Vec<EntityKey>,
}

impl fmt::Display for SessionStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionStatistics[entity count={}]", self.entity_count)
    }
}

pub struct Session {
    id: u64,
    factory: SessionFactory,
    tenant: Option<String>,
    flush_mode: FlushMode,
    cache_mode: CacheMode,
    default_read_only: bool,
    entries: HashMap<EntityKey, EntityEntry>,
    next_seq: u64,
    open: bool,
    /// Connection held between operations: the caller's, or the one pinned
    /// by an open transaction.
    connection: Option<Connection>,
    supplied_connection: bool,
    in_transaction: bool,
    /// Stores this session holds row locks in.
    locked_stores: Vec<Arc<EntityStore>>,
}

impl Session {
    pub(crate) fn open(factory: SessionFactory, options: SessionOptions) -> Self {
        let id = factory.next_session_id();
        let supplied_connection = options.connection.is_some();
        event!(
            Level::DEBUG,
            session_id = id,
            tenant = ?options.tenant,
            flush_mode = %options.flush_mode,
            cache_mode = %options.cache_mode,
            "session opened"
        );
        Self {
            id,
            factory,
            tenant: options.tenant,
            flush_mode: options.flush_mode,
            cache_mode: options.cache_mode,
            default_read_only: options.default_read_only,
            entries: HashMap::new(),
            next_seq: 0,
            open: true,
            connection: options.connection,
            supplied_connection,
            in_transaction: false,
            locked_stores: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// False only for a session whose caller-supplied connection has been
    /// taken back with [`Session::disconnect`].
    pub fn is_connected(&self) -> bool {
        self.open && (!self.supplied_connection || self.connection.is_some())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(PersistError::IllegalState("Session is closed".into()));
        }
        Ok(())
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.cache_mode = mode;
    }

    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    /// Affects entities loaded from now on, not those already tracked.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    pub fn is_transaction_active(&self) -> bool {
        self.in_transaction
    }

    // ---- identity map ----

    /// Whether this exact instance is tracked and not scheduled for deletion.
    pub fn contains<E: Entity>(&self, handle: &EntityHandle<E>) -> bool {
        self.open
            && handle
                .key()
                .and_then(|key| self.entries.get(&key))
                .is_some_and(|entry| {
                    entry.is_instance(handle) && entry.status != EntryStatus::Deleted
                })
    }

    fn tracked_entry<E: Entity>(&self, handle: &EntityHandle<E>) -> Result<&EntityEntry> {
        let not_tracked =
            || PersistError::InvalidState(format!("{} instance is not tracked", E::ENTITY_NAME));
        let key = handle.key().ok_or_else(not_tracked)?;
        match self.entries.get(&key) {
            Some(entry) if entry.is_instance(handle) => Ok(entry),
            _ => Err(not_tracked()),
        }
    }

    fn tracked_entry_mut<E: Entity>(
        &mut self,
        handle: &EntityHandle<E>,
    ) -> Result<&mut EntityEntry> {
        let not_tracked =
            || PersistError::InvalidState(format!("{} instance is not tracked", E::ENTITY_NAME));
        let key = handle.key().ok_or_else(not_tracked)?;
        match self.entries.get_mut(&key) {
            Some(entry) if entry.is_instance(handle) => Ok(entry),
            _ => Err(not_tracked()),
        }
    }

    pub fn get_identifier<E: Entity>(
        &self,
        handle: &EntityHandle<E>,
    ) -> Result<crate::core::EntityId> {
        self.ensure_open()?;
        self.tracked_entry(handle)?;
        handle
            .id()
            .ok_or_else(|| PersistError::InternalInvariant("tracked instance lost its id".into()))
    }

    pub fn get_entity_name<E: Entity>(&self, handle: &EntityHandle<E>) -> Result<&'static str> {
        self.ensure_open()?;
        Ok(self.tracked_entry(handle)?.instance.entity_name())
    }

    /// The strongest lock mode obtained for the instance. Lock requests never
    /// lower it; a pessimistic mode falls back to `None` once commit, rollback
    /// or close releases the row lock behind it.
    pub fn get_current_lock_mode<E: Entity>(&self, handle: &EntityHandle<E>) -> Result<LockMode> {
        self.ensure_open()?;
        Ok(self.tracked_entry(handle)?.lock_mode)
    }

    pub fn is_read_only<E: Entity>(&self, handle: &EntityHandle<E>) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.tracked_entry(handle)?.read_only)
    }

    /// Marks a tracked instance read-only or modifiable. Making it modifiable
    /// takes its current state as the new snapshot, so edits made while it
    /// was read-only are never flushed.
    pub fn set_read_only<E: Entity>(&mut self, handle: &EntityHandle<E>, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        let entry = self.tracked_entry_mut(handle)?;
        if entry.read_only && !read_only && entry.status == EntryStatus::Managed {
            entry.snapshot = Some(entry.instance.state()?);
        }
        entry.read_only = read_only;
        Ok(())
    }

    pub fn statistics(&self) -> SessionStatistics {
        let mut entity_keys: Vec<EntityKey> = self.entries.keys().cloned().collect();
        entity_keys.sort();
        SessionStatistics {
            entity_count: entity_keys.len(),
            entity_keys,
        }
    }

    /// Stops tracking the instance, and the tracked instances its evict
    /// cascade reaches, discarding their pending changes. Untracked instances
    /// are ignored.
    pub fn evict<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.ensure_open()?;
        let Some(key) = handle.key() else {
            return Ok(());
        };
        if !self
            .entries
            .get(&key)
            .is_some_and(|entry| entry.is_instance(handle))
        {
            return Ok(());
        }

        let evicted = self.cascade_closure(&key, CascadeAction::Evict);
        for key in &evicted {
            self.entries.remove(key);
        }
        event!(Level::DEBUG, session_id = self.id, entity = %key, evicted = evicted.len(), "evicted");
        Ok(())
    }

    /// Untracks every instance without flushing.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.entries.clear();
        Ok(())
    }

    /// `root` plus every tracked key reachable through `action` cascades.
    fn cascade_closure(&self, root: &EntityKey, action: CascadeAction) -> Vec<EntityKey> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue = vec![root.clone()];

        while let Some(key) = queue.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&key) {
                queue.extend(
                    entry
                        .instance
                        .cascade_targets(action)
                        .into_iter()
                        .filter(|target| self.entries.contains_key(target)),
                );
                ordered.push(key);
            }
        }
        ordered
    }

    fn track(
        &mut self,
        key: EntityKey,
        instance: Box<dyn ManagedState>,
        status: EntryStatus,
    ) -> &mut EntityEntry {
        self.next_seq += 1;
        let entry = EntityEntry::new(self.next_seq, instance, status);
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(entry),
        }
    }

    // ---- cache gating ----

    fn counters(&self) -> &StatisticsCounters {
        &self.factory.inner().statistics
    }

    /// Cache regions are keyed by entity name and identifier only, so
    /// tenant-bound sessions never use them.
    fn second_level_cache(&self) -> bool {
        self.tenant.is_none() && self.factory.config().second_level_cache
    }

    fn cache_readable(&self) -> bool {
        self.second_level_cache() && self.cache_mode.is_read_enabled()
    }

    fn cache_writable(&self) -> bool {
        self.second_level_cache() && self.cache_mode.is_write_enabled()
    }

    fn minimal_puts(&self) -> bool {
        self.factory.config().use_minimal_puts && !self.cache_mode.ignores_minimal_puts()
    }

    /// Puts a synchronized entry into the entity, natural-id and collection
    /// regions when the cache mode allows writes.
    fn cache_entry(&self, key: &EntityKey, minimal_put: bool) -> Result<()> {
        if !self.cache_writable() {
            return Ok(());
        }
        let Some(entry) = self.entries.get(key) else {
            return Ok(());
        };
        let (Some(snapshot), Some(version)) = (&entry.snapshot, entry.version) else {
            return Ok(());
        };

        let cache = &self.factory.inner().cache;
        let written = cache.put_entity(
            &key.entity_name,
            &key.id,
            CachedEntity::new(snapshot.clone(), version),
            minimal_put,
        );
        if written {
            StatisticsCounters::bump(&self.counters().cache_puts);
        }
        if let Some(natural_id) = entry.instance.natural_id() {
            cache.put_natural_id(&key.entity_name, &natural_id, &key.id);
        }
        for (property, elements) in entry.instance.collections() {
            cache.put_collection(&collection_role(&key.entity_name, property), &key.id, elements);
        }
        Ok(())
    }

    /// Drops an entry's cached entity and collection snapshots.
    fn evict_cached(&self, key: &EntityKey, entry: &EntityEntry) {
        let cache = &self.factory.inner().cache;
        cache.evict_entity(&key.entity_name, &key.id);
        for (property, _) in entry.instance.collections() {
            cache.evict_collection(&collection_role(&key.entity_name, property), &key.id);
        }
    }

    /// Forgets every tracked instance after a rollback, together with the
    /// cache entries the rolled back flushes may have written.
    fn discard_rolled_back(&mut self) {
        for (key, entry) in &self.entries {
            self.evict_cached(key, entry);
        }
        if self.factory.config().query_cache {
            self.factory.inner().cache.evict_all_query_regions();
        }
        self.entries.clear();
    }

    // ---- connections ----

    /// Takes the connection for one operation, bound to this session as lock
    /// owner; hand it back with [`Session::give_back`].
    pub(crate) async fn lease(&mut self) -> Result<Connection> {
        self.ensure_open()?;
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None if self.supplied_connection || self.in_transaction => {
                return Err(PersistError::IllegalState("Session is disconnected".into()));
            }
            None => {
                let provider = &self.factory.inner().provider;
                match &self.tenant {
                    Some(tenant) => provider.get_connection(tenant).await?,
                    None => provider.get_any_connection().await?,
                }
            }
        };
        connection.bind_owner(self.id);
        Ok(connection)
    }

    pub(crate) async fn give_back(&mut self, connection: Connection) -> Result<()> {
        if self.supplied_connection || self.in_transaction {
            self.connection = Some(connection);
            return Ok(());
        }
        self.release_to_provider(connection).await
    }

    async fn release_to_provider(&self, connection: Connection) -> Result<()> {
        let provider = &self.factory.inner().provider;
        match &self.tenant {
            Some(tenant) => provider.release_connection(tenant, connection).await,
            None => provider.release_any_connection(connection).await,
        }
    }

    fn remember_locked_store(&mut self, store: &Arc<EntityStore>) {
        if !self.locked_stores.iter().any(|known| Arc::ptr_eq(known, store)) {
            self.locked_stores.push(Arc::clone(store));
        }
    }

    fn release_locks(&mut self) {
        let released: usize = self
            .locked_stores
            .drain(..)
            .map(|store| store.locks().release_owner(self.id))
            .sum();
        if released > 0 {
            event!(Level::DEBUG, session_id = self.id, released, "row locks released");
        }
        for entry in self.entries.values_mut() {
            if entry.lock_mode.is_pessimistic() {
                entry.lock_mode = LockMode::None;
            }
        }
    }

    /// Ends the session. An open transaction is rolled back and row locks are
    /// released. Returns the caller-supplied connection, if there was one.
    pub async fn close(&mut self) -> Result<Option<Connection>> {
        self.ensure_open()?;

        let mut outcome = Ok(());
        if self.in_transaction {
            if let Some(mut connection) = self.connection.take() {
                outcome = connection.rollback().await;
                self.connection = Some(connection);
            }
            self.in_transaction = false;
            StatisticsCounters::bump(&self.counters().transactions_rolled_back);
            self.discard_rolled_back();
        }

        self.release_locks();
        self.entries.clear();
        self.open = false;
        StatisticsCounters::bump(&self.counters().sessions_closed);
        event!(Level::DEBUG, session_id = self.id, "session closed");

        let connection = self.connection.take();
        let returned = match connection {
            Some(connection) if !self.supplied_connection => {
                self.release_to_provider(connection).await?;
                None
            }
            other => other,
        };
        outcome.map(|_| returned)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if self.in_transaction {
            log::warn!("session {} dropped with an active transaction; rolling back", self.id);
            if let Some(mut connection) = self.connection.take() {
                if let Err(err) = connection.rollback_now() {
                    log::warn!("session {}: rollback on drop failed: {}", self.id, err);
                }
                // Dropping a pooled connection frees its pool slot.
            }
            self.in_transaction = false;
            StatisticsCounters::bump(&self.counters().transactions_rolled_back);
            self.discard_rolled_back();
        }
        self.release_locks();
        StatisticsCounters::bump(&self.counters().sessions_closed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.open)
            .field("tenant", &self.tenant)
            .field("flush_mode", &self.flush_mode)
            .field("cache_mode", &self.cache_mode)
            .field("entities", &self.entries.len())
            .finish()
    }
}
