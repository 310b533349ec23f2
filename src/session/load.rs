use super::Session;
use super::entry::EntryStatus;
use crate::cache::CachedEntity;
use crate::core::{
    CascadeAction, Entity, EntityHandle, EntityId, EntityKey, PersistError, Result,
};
use crate::factory::StatisticsCounters;
use crate::mode::{LockMode, LockOptions};
use crate::storage::StoredRow;
use tracing::{Level, event};

impl Session {
    /// Returns the instance with `id`, failing with `NotFound` when no row exists.
    pub async fn load<E: Entity>(
        &mut self,
        id: impl Into<EntityId>,
        options: impl Into<LockOptions>,
    ) -> Result<EntityHandle<E>> {
        let key = EntityKey::new(E::ENTITY_NAME, id);
        self.get_with_lock(key.id.clone(), options)
            .await?
            .ok_or_else(|| PersistError::NotFound(key.to_string()))
    }

    pub async fn get<E: Entity>(&mut self, id: impl Into<EntityId>) -> Result<Option<EntityHandle<E>>> {
        self.get_with_lock(id, LockOptions::NONE).await
    }

    /// Returns the tracked instance when there is one, without reading the
    /// store. Otherwise the instance is built from the second-level cache or
    /// the store and starts being tracked. Either way the lock is raised to
    /// `options.mode`.
    pub async fn get_with_lock<E: Entity>(
        &mut self,
        id: impl Into<EntityId>,
        options: impl Into<LockOptions>,
    ) -> Result<Option<EntityHandle<E>>> {
        self.ensure_open()?;
        let options = options.into();
        if options.mode == LockMode::Write {
            return Err(PersistError::InvalidState(
                "LockMode::Write cannot be requested".into(),
            ));
        }
        let key = EntityKey::new(E::ENTITY_NAME, id);

        if let Some(entry) = self.entries.get(&key) {
            if entry.status == EntryStatus::Deleted {
                return Ok(None);
            }
            let handle = entry.handle::<E>()?;
            self.lock_tracked(&key, options).await?;
            return Ok(Some(handle));
        }

        // A pessimistic read must see the row as of the lock.
        let pessimistic = options.mode.is_pessimistic();
        if pessimistic {
            self.acquire_row_lock(&key, options).await?;
        }

        let cached = if pessimistic { None } else { self.cached_entity(&key) };
        let from_store = cached.is_none();
        let (state, version) = match cached {
            Some(cached) => (cached.state, cached.version),
            None => match self.fetch_row(&key).await? {
                Some(row) => (row.state, row.version),
                None => {
                    if pessimistic {
                        self.release_row_lock(&key);
                    }
                    return Ok(None);
                }
            },
        };

        let handle = EntityHandle::<E>::from_state(&key.id, state)?;
        let read_only = self.default_read_only;
        let entry = self.track(key.clone(), Box::new(handle.clone()), EntryStatus::Managed);
        entry.read_only = read_only;
        entry.synchronized(version)?;

        let counters = self.counters();
        StatisticsCounters::bump(&counters.entity_loads);
        if from_store {
            StatisticsCounters::bump(&counters.entity_fetches);
            self.cache_entry(&key, self.minimal_puts())?;
        }
        event!(Level::TRACE, session_id = self.id, entity = %key, from_store, "loaded");

        self.lock_tracked(&key, options).await?;
        Ok(Some(handle))
    }

    /// Looks an instance up by its natural id: tracked instances first, then
    /// the natural-id cache region, then a scan of the store.
    pub async fn get_by_natural_id<E: Entity>(
        &mut self,
        natural_id: &str,
    ) -> Result<Option<EntityHandle<E>>> {
        self.ensure_open()?;

        let tracked = self.entries.iter().find(|(key, entry)| {
            key.entity_name == E::ENTITY_NAME
                && entry.status != EntryStatus::Deleted
                && entry.instance.natural_id().as_deref() == Some(natural_id)
        });
        if let Some((_, entry)) = tracked {
            return entry.handle::<E>().map(Some);
        }

        if self.cache_readable() {
            let resolved = self
                .factory
                .inner()
                .cache
                .resolve_natural_id(E::ENTITY_NAME, natural_id);
            if let Some(id) = resolved {
                if let Some(handle) = self.get::<E>(id).await? {
                    if handle.read().natural_id().as_deref() == Some(natural_id) {
                        return Ok(Some(handle));
                    }
                }
            }
        }

        let connection = self.lease().await?;
        let rows = connection.scan(E::ENTITY_NAME).await;
        self.give_back(connection).await?;

        for (id, row) in rows? {
            let entity: E = serde_json::from_value(row.state)?;
            if entity.natural_id().as_deref() != Some(natural_id) {
                continue;
            }
            if self.cache_writable() {
                self.factory
                    .inner()
                    .cache
                    .put_natural_id(E::ENTITY_NAME, natural_id, &id);
            }
            return self.get::<E>(id).await;
        }
        Ok(None)
    }

    pub async fn refresh<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.refresh_with_lock(handle, LockOptions::NONE).await
    }

    /// Discards the in-memory state of a tracked instance and re-reads it from
    /// the store, bypassing cache reads. The fresh state is always written to
    /// the cache when the cache mode allows writes.
    ///
    /// Use this to correct state known to be stale (after a trigger or a
    /// [`Work`](super::Work) callback changed the row), not as a cache.
    pub async fn refresh_with_lock<E: Entity>(
        &mut self,
        handle: &EntityHandle<E>,
        options: impl Into<LockOptions>,
    ) -> Result<()> {
        self.ensure_open()?;
        let options = options.into();
        let key = handle.key().ok_or_else(|| {
            PersistError::InvalidState(format!("cannot refresh a transient {}", E::ENTITY_NAME))
        })?;

        match self.entries.get(&key) {
            None => {
                return Err(PersistError::InvalidState(format!("{} is not tracked", key)));
            }
            Some(entry) if !entry.is_instance(handle) => {
                return Err(PersistError::Conflict(format!(
                    "a different instance of {} is tracked",
                    key
                )));
            }
            Some(entry) => match entry.status {
                EntryStatus::Deleted => {
                    return Err(PersistError::InvalidState(format!("{} was deleted", key)));
                }
                EntryStatus::Saving { .. } => {
                    return Err(PersistError::InvalidState(format!(
                        "{} has not been flushed yet",
                        key
                    )));
                }
                EntryStatus::Managed => {}
            },
        }

        self.refresh_key(&key).await?;

        let targets = self.cascade_closure(&key, CascadeAction::Refresh);
        for target in targets.iter().filter(|target| **target != key) {
            let refreshable = self
                .entries
                .get(target)
                .is_some_and(|entry| entry.status == EntryStatus::Managed);
            if refreshable {
                self.refresh_key(target).await?;
            }
        }

        self.lock_tracked(&key, options).await
    }

    async fn refresh_key(&mut self, key: &EntityKey) -> Result<()> {
        let Some(row) = self.fetch_row(key).await? else {
            self.entries.remove(key);
            return Err(PersistError::NotFound(key.to_string()));
        };

        if let Some(entry) = self.entries.get_mut(key) {
            entry.instance.overwrite(&key.id, row.state)?;
            entry.synchronized(row.version)?;
        }
        StatisticsCounters::bump(&self.counters().entity_fetches);
        self.cache_entry(key, false)?;
        event!(Level::DEBUG, session_id = self.id, entity = %key, version = row.version, "refreshed");
        Ok(())
    }

    /// Reads a cached snapshot when the cache mode allows reads.
    fn cached_entity(&self, key: &EntityKey) -> Option<CachedEntity> {
        if !self.cache_readable() {
            return None;
        }
        let cached = self
            .factory
            .inner()
            .cache
            .get_entity(&key.entity_name, &key.id);
        let counters = self.counters();
        match &cached {
            Some(_) => StatisticsCounters::bump(&counters.cache_hits),
            None => StatisticsCounters::bump(&counters.cache_misses),
        }
        cached
    }

    pub(super) async fn fetch_row(&mut self, key: &EntityKey) -> Result<Option<StoredRow>> {
        let connection = self.lease().await?;
        let row = connection.fetch(key).await;
        self.give_back(connection).await?;
        row
    }
}
