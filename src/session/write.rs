use super::Session;
use super::entry::{EntryStatus, PendingWrite};
use crate::core::{
    CascadeAction, Entity, EntityHandle, EntityId, EntityKey, IdStrategy, ManagedState,
    PersistError, Result,
};
use crate::mode::ReplicationMode;
use std::cmp::Ordering;
use tracing::{Level, event};

impl Session {
    /// Makes a transient instance persistent and returns its new identifier.
    /// The row is inserted at the next flush.
    pub async fn save<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<EntityId> {
        self.ensure_open()?;

        if let Some(key) = handle.key() {
            match self.entries.get_mut(&key) {
                Some(entry) if entry.is_instance(handle) => {
                    if entry.status == EntryStatus::Deleted {
                        entry.status = EntryStatus::Managed;
                    }
                    return Ok(key.id);
                }
                Some(_) => {
                    return Err(PersistError::Conflict(format!(
                        "a different instance of {} is tracked",
                        key
                    )));
                }
                None if E::ID_STRATEGY != IdStrategy::Assigned => {
                    return Err(PersistError::InvalidState(format!(
                        "{} is detached; use update or merge",
                        key
                    )));
                }
                None => {
                    let connection = self.lease().await?;
                    let exists = connection.exists(&key).await;
                    self.give_back(connection).await?;
                    if exists? {
                        return Err(PersistError::InvalidState(format!(
                            "{} is already persistent; use update or merge",
                            key
                        )));
                    }
                }
            }
        }

        let id = match (handle.id(), E::ID_STRATEGY) {
            (Some(id), _) => id,
            (None, IdStrategy::Assigned) => {
                return Err(PersistError::InvalidState(format!(
                    "{} uses assigned identifiers; set one before saving",
                    E::ENTITY_NAME
                )));
            }
            (None, IdStrategy::Uuid) => EntityId::new_uuid(),
            (None, IdStrategy::Sequence) => {
                let connection = self.lease().await?;
                let next = connection.next_sequence(E::ENTITY_NAME).await;
                self.give_back(connection).await?;
                EntityId::Int(next?)
            }
        };

        handle.write().set_id(id.clone());
        self.schedule_insert(handle, id.clone());
        Ok(id)
    }

    /// Like [`Session::save`], without returning the identifier.
    pub async fn persist<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.save(handle).await.map(|_| ())
    }

    /// Saves a transient instance or reattaches a detached one.
    pub async fn save_or_update<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.ensure_open()?;
        let Some(key) = handle.key() else {
            return self.persist(handle).await;
        };
        if self.entries.contains_key(&key) {
            return self.update(handle).await;
        }
        if E::ID_STRATEGY == IdStrategy::Assigned {
            let connection = self.lease().await?;
            let exists = connection.exists(&key).await;
            self.give_back(connection).await?;
            if !exists? {
                return self.persist(handle).await;
            }
        }
        self.update(handle).await
    }

    /// Reattaches a detached instance. Its state is written unconditionally at
    /// the next flush.
    pub async fn update<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.ensure_open()?;
        let key = handle.key().ok_or_else(|| {
            PersistError::InvalidState(format!("cannot update a transient {}", E::ENTITY_NAME))
        })?;

        if let Some(entry) = self.entries.get(&key) {
            if !entry.is_instance(handle) {
                return Err(PersistError::Conflict(format!(
                    "a different instance of {} is already tracked",
                    key
                )));
            }
            if entry.status == EntryStatus::Deleted {
                return Err(PersistError::InvalidState(format!("{} was deleted", key)));
            }
            return Ok(());
        }

        let state = ManagedState::state(handle)?;
        let version = handle.read().version();
        let entry = self.track(key.clone(), Box::new(handle.clone()), EntryStatus::Managed);
        entry.snapshot = Some(state);
        entry.version = version;
        entry.pending = Some(PendingWrite::Reattached);
        event!(Level::DEBUG, session_id = self.id, entity = %key, "reattached");
        Ok(())
    }

    /// Copies the state of `handle` onto the tracked instance with the same
    /// identifier, loading it first if needed, and returns that instance.
    /// `handle` itself never becomes tracked.
    pub async fn merge<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<EntityHandle<E>> {
        self.ensure_open()?;
        let Some(key) = handle.key() else {
            let copy = EntityHandle::new(copy_entity(handle)?);
            self.save(&copy).await?;
            return Ok(copy);
        };

        if let Some(entry) = self.entries.get(&key) {
            if entry.is_instance(handle) {
                return Ok(handle.clone());
            }
            if entry.status == EntryStatus::Deleted {
                return Err(PersistError::InvalidState(format!(
                    "cannot merge into deleted {}",
                    key
                )));
            }
        }

        let target = match self.get::<E>(key.id.clone()).await? {
            Some(target) => target,
            None => {
                let copy = EntityHandle::new(copy_entity(handle)?);
                self.schedule_insert(&copy, key.id.clone());
                return Ok(copy);
            }
        };

        let entry = self.entries.get(&key).ok_or_else(|| {
            PersistError::InternalInvariant(format!("{} vanished during merge", key))
        })?;
        let tracked_version = entry.version;
        let merged_version = handle.read().version();
        if let (Some(tracked), Some(merged)) = (tracked_version, merged_version) {
            if tracked != merged {
                return Err(PersistError::StaleState(format!(
                    "{} is at version {}, merged state has {}",
                    key, tracked, merged
                )));
            }
        }

        entry.instance.overwrite(&key.id, ManagedState::state(handle)?)?;
        if let Some(version) = tracked_version {
            entry.instance.set_version(version);
        }
        Ok(target)
    }

    /// Schedules a tracked instance, and the tracked instances its delete
    /// cascade reaches, for deletion at the next flush. Deleting an instance
    /// that was saved but never flushed just stops tracking it.
    pub async fn delete<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.ensure_open()?;
        let key = handle.key().ok_or_else(|| {
            PersistError::InvalidState(format!("cannot delete a transient {}", E::ENTITY_NAME))
        })?;
        match self.entries.get(&key) {
            None => {
                return Err(PersistError::InvalidState(format!(
                    "{} is not tracked by this session",
                    key
                )));
            }
            Some(entry) if !entry.is_instance(handle) => {
                return Err(PersistError::Conflict(format!(
                    "a different instance of {} is tracked",
                    key
                )));
            }
            Some(_) => {}
        }

        for target in self.cascade_closure(&key, CascadeAction::Delete) {
            self.schedule_delete(&target);
        }
        Ok(())
    }

    fn schedule_delete(&mut self, key: &EntityKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let status = entry.status;
        match status {
            EntryStatus::Saving { .. } => {
                self.entries.remove(key);
            }
            EntryStatus::Managed => entry.status = EntryStatus::Deleted,
            EntryStatus::Deleted => {}
        }
    }

    /// Copies a detached instance's state into the store under its current
    /// identifier. `mode` decides what happens when the row already exists;
    /// with `Exception` the row is always inserted and a duplicate fails the
    /// flush.
    pub async fn replicate<E: Entity>(
        &mut self,
        handle: &EntityHandle<E>,
        mode: ReplicationMode,
    ) -> Result<()> {
        self.ensure_open()?;
        let key = handle.key().ok_or_else(|| {
            PersistError::InvalidState(format!("cannot replicate a transient {}", E::ENTITY_NAME))
        })?;
        if self.entries.contains_key(&key) {
            return Err(PersistError::Conflict(format!(
                "{} is already tracked by this session",
                key
            )));
        }

        if mode == ReplicationMode::Exception {
            self.schedule_insert(handle, key.id.clone());
            return Ok(());
        }

        let Some(row) = self.fetch_row(&key).await? else {
            self.schedule_insert(handle, key.id.clone());
            return Ok(());
        };

        let replicated_version = handle.read().version();
        let overwrite = mode.should_overwrite_current_version(
            &Some(row.version),
            &replicated_version,
            compare_versions,
        )?;
        event!(Level::DEBUG, session_id = self.id, entity = %key, %mode, overwrite, "replicate");
        if !overwrite {
            return Ok(());
        }

        let state = ManagedState::state(handle)?;
        let entry = self.track(key, Box::new(handle.clone()), EntryStatus::Managed);
        entry.snapshot = Some(state);
        entry.version = Some(row.version);
        entry.pending = Some(PendingWrite::Replicated {
            version: replicated_version,
        });
        Ok(())
    }

    fn schedule_insert<E: Entity>(&mut self, handle: &EntityHandle<E>, id: EntityId) {
        let version = handle.read().version().unwrap_or(0);
        let key = EntityKey::new(E::ENTITY_NAME, id);
        self.track(key, Box::new(handle.clone()), EntryStatus::Saving { version });
    }
}

/// Unversioned rows never lose to a replicated copy.
fn compare_versions(current: &Option<i64>, replicated: &Option<i64>) -> Ordering {
    match (current, replicated) {
        (Some(current), Some(replicated)) => current.cmp(replicated),
        _ => Ordering::Equal,
    }
}

fn copy_entity<E: Entity>(handle: &EntityHandle<E>) -> Result<E> {
    Ok(serde_json::from_value(ManagedState::state(handle)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions_treats_missing_as_equal() {
        assert_eq!(compare_versions(&Some(3), &Some(5)), Ordering::Less);
        assert_eq!(compare_versions(&Some(5), &Some(3)), Ordering::Greater);
        assert_eq!(compare_versions(&None, &Some(3)), Ordering::Equal);
        assert_eq!(compare_versions(&Some(3), &None), Ordering::Equal);
    }
}
