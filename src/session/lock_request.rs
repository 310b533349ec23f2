use super::Session;
use super::entry::EntryStatus;
use crate::core::{
    CascadeAction, Entity, EntityHandle, EntityKey, ManagedState, PersistError, Result,
};
use crate::mode::{LockMode, LockOptions, LockTimeout};
use crate::storage::{Change, RowLockKind};
use std::sync::Arc;
use tracing::{Level, event};

/// A pending lock acquisition built by [`Session::build_lock_request`].
pub struct LockRequest<'s> {
    session: &'s mut Session,
    options: LockOptions,
}

impl<'s> LockRequest<'s> {
    pub fn set_lock_mode(mut self, mode: LockMode) -> Self {
        self.options.mode = mode;
        self
    }

    /// `-1` waits forever, `0` fails immediately, `n > 0` waits up to `n` ms.
    pub fn set_timeout(mut self, millis: i64) -> Self {
        self.options.timeout = LockTimeout::from_millis(millis);
        self
    }

    pub fn set_scope(mut self, scope: bool) -> Self {
        self.options.scope = scope;
        self
    }

    pub fn lock_mode(&self) -> LockMode {
        self.options.mode
    }

    pub fn timeout(&self) -> i64 {
        self.options.timeout.as_millis()
    }

    pub fn scope(&self) -> bool {
        self.options.scope
    }

    /// Raises the lock on `handle`. A detached instance is reattached first.
    pub async fn lock<E: Entity>(&mut self, handle: &EntityHandle<E>) -> Result<()> {
        self.session.lock_handle(handle, self.options).await
    }
}

impl Session {
    pub fn build_lock_request(&mut self, options: impl Into<LockOptions>) -> LockRequest<'_> {
        LockRequest {
            session: self,
            options: options.into(),
        }
    }

    async fn lock_handle<E: Entity>(
        &mut self,
        handle: &EntityHandle<E>,
        options: LockOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        if options.mode == LockMode::Write {
            return Err(PersistError::InvalidState(
                "LockMode::Write cannot be requested".into(),
            ));
        }
        let key = handle.key().ok_or_else(|| {
            PersistError::InvalidState(format!("cannot lock a transient {}", E::ENTITY_NAME))
        })?;

        match self.entries.get(&key) {
            Some(entry) if !entry.is_instance(handle) => {
                return Err(PersistError::Conflict(format!(
                    "a different instance of {} is tracked",
                    key
                )));
            }
            Some(entry) if entry.status == EntryStatus::Deleted => {
                return Err(PersistError::InvalidState(format!("{} was deleted", key)));
            }
            Some(_) => {}
            None => {
                let state = ManagedState::state(handle)?;
                let version = handle.read().version();
                let entry = self.track(key.clone(), Box::new(handle.clone()), EntryStatus::Managed);
                entry.snapshot = Some(state);
                entry.version = version;
                event!(Level::DEBUG, session_id = self.id, entity = %key, "reattached for lock");
            }
        }

        self.lock_tracked(&key, options).await
    }

    /// Raises the lock of a tracked entry and, with `options.scope`, of every
    /// tracked entry its lock cascade reaches.
    pub(super) async fn lock_tracked(&mut self, key: &EntityKey, options: LockOptions) -> Result<()> {
        if options.mode == LockMode::None {
            return Ok(());
        }
        if !options.scope {
            return self.lock_one(key, options).await;
        }
        for target in self.cascade_closure(key, CascadeAction::Lock) {
            self.lock_one(&target, options).await?;
        }
        Ok(())
    }

    async fn lock_one(&mut self, key: &EntityKey, options: LockOptions) -> Result<()> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(());
        };
        let current = entry.lock_mode;
        if !options.mode.greater_than(current) {
            return Ok(());
        }
        let saving = matches!(entry.status, EntryStatus::Saving { .. });
        let version = entry.version;

        match options.mode {
            LockMode::Read => {
                if let (Some(expected_version), false) = (version, saving) {
                    self.execute_now(vec![Change::VerifyVersion {
                        key: key.clone(),
                        expected_version,
                    }])
                    .await?;
                }
            }
            LockMode::Optimistic => self.entry_mut(key)?.verify_version = true,
            LockMode::OptimisticForceIncrement => self.entry_mut(key)?.force_increment = true,
            mode if mode.is_pessimistic() => {
                if !saving {
                    self.acquire_row_lock(key, options).await?;
                }
                if mode == LockMode::PessimisticForceIncrement && !saving {
                    let versions = self
                        .execute_now(vec![Change::IncrementVersion {
                            key: key.clone(),
                            expected_version: version,
                        }])
                        .await?;
                    if let Some(&bumped) = versions.first() {
                        self.entry_mut(key)?.bump_version(bumped)?;
                    }
                }
            }
            _ => {}
        }

        let session_id = self.id;
        let entry = self.entry_mut(key)?;
        entry.lock_mode = entry.lock_mode.max(options.mode);
        event!(
            Level::DEBUG,
            session_id,
            entity = %key,
            from = %current,
            to = %entry.lock_mode,
            "lock raised"
        );
        Ok(())
    }

    fn entry_mut(&mut self, key: &EntityKey) -> Result<&mut super::entry::EntityEntry> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| PersistError::InternalInvariant(format!("{} is no longer tracked", key)))
    }

    /// Takes a row lock in the store on behalf of this session. The
    /// connection only locates the store and is given back before waiting.
    pub(super) async fn acquire_row_lock(&mut self, key: &EntityKey, options: LockOptions) -> Result<()> {
        let kind = if options.mode == LockMode::PessimisticRead {
            RowLockKind::Shared
        } else {
            RowLockKind::Exclusive
        };

        let connection = self.lease().await?;
        let usable = connection.ensure_open();
        let store = Arc::clone(connection.store());
        self.give_back(connection).await?;
        usable?;
        self.remember_locked_store(&store);

        let acquired = store
            .locks()
            .acquire(key, self.id, kind, options.effective_timeout())
            .await;
        if let Err(err) = acquired {
            event!(Level::WARN, session_id = self.id, entity = %key, error = %err, "row lock not granted");
            return Err(err);
        }
        Ok(())
    }

    pub(super) fn release_row_lock(&self, key: &EntityKey) {
        for store in &self.locked_stores {
            store.locks().release(key, self.id);
        }
    }

    /// Runs a batch outside of flush, for lock-driven version checks.
    async fn execute_now(&mut self, changes: Vec<Change>) -> Result<Vec<i64>> {
        let mut connection = self.lease().await?;
        let result = connection.execute(&changes).await;
        self.give_back(connection).await?;
        if let Err(PersistError::StaleState(_)) = &result {
            crate::factory::StatisticsCounters::bump(&self.counters().optimistic_failures);
        }
        result
    }
}
