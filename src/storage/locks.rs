use crate::core::{EntityKey, PersistError, Result};
use crate::mode::LockTimeout;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct RowLock {
    shared: HashSet<u64>,
    exclusive: Option<u64>,
}

impl RowLock {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }

    fn grant(&mut self, owner: u64, kind: RowLockKind) -> bool {
        match kind {
            RowLockKind::Shared => match self.exclusive {
                Some(holder) => holder == owner,
                None => {
                    self.shared.insert(owner);
                    true
                }
            },
            RowLockKind::Exclusive => {
                if let Some(holder) = self.exclusive {
                    return holder == owner;
                }
                if self.shared.iter().any(|holder| *holder != owner) {
                    return false;
                }
                self.shared.remove(&owner);
                self.exclusive = Some(owner);
                true
            }
        }
    }
}

/// Row locks held by sessions (owners) against one store.
///
/// Locks are re-entrant per owner and a sole shared holder may upgrade to
/// exclusive. Owners keep their locks until [`LockTable::release_owner`].
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<EntityKey, RowLock>>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: &EntityKey, owner: u64, kind: RowLockKind) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = held.entry(key.clone()).or_default();
        let granted = lock.grant(owner, kind);
        if lock.is_free() {
            held.remove(key);
        }
        granted
    }

    /// Waits for the lock according to `timeout`.
    ///
    /// `NoWait` fails immediately with `LockUnavailable`; a bounded wait fails
    /// with `LockTimeout` once it expires.
    pub async fn acquire(
        &self,
        key: &EntityKey,
        owner: u64,
        kind: RowLockKind,
        timeout: LockTimeout,
    ) -> Result<()> {
        let deadline = timeout.as_duration().map(|wait| Instant::now() + wait);

        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();

            if self.try_acquire(key, owner, kind) {
                return Ok(());
            }

            match (timeout, deadline) {
                (LockTimeout::NoWait, _) => {
                    return Err(PersistError::LockUnavailable(key.to_string()));
                }
                (_, None) => released.await,
                (_, Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline
                        || tokio::time::timeout(deadline - now, released).await.is_err()
                    {
                        if self.try_acquire(key, owner, kind) {
                            return Ok(());
                        }
                        return Err(PersistError::LockTimeout {
                            key: key.to_string(),
                            timeout_ms: timeout.as_millis().max(0) as u64,
                        });
                    }
                }
            }
        }
    }

    /// Fails with `LockUnavailable` when another owner holds any lock on one
    /// of `keys`. With `hold`, `owner` then keeps an exclusive lock on each of
    /// them. Nothing is granted when the check fails.
    pub fn claim_writes(&self, keys: &[&EntityKey], owner: u64, hold: bool) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        let blocked = keys.iter().find(|key| {
            held.get(**key).is_some_and(|lock| {
                lock.exclusive.is_some_and(|holder| holder != owner)
                    || lock.shared.iter().any(|holder| *holder != owner)
            })
        });
        if let Some(key) = blocked {
            return Err(PersistError::LockUnavailable(key.to_string()));
        }

        if hold {
            for key in keys {
                held.entry((*key).clone())
                    .or_default()
                    .grant(owner, RowLockKind::Exclusive);
            }
        }
        Ok(())
    }

    pub fn release(&self, key: &EntityKey, owner: u64) {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(lock) = held.get_mut(key) {
                lock.shared.remove(&owner);
                if lock.exclusive == Some(owner) {
                    lock.exclusive = None;
                }
                if lock.is_free() {
                    held.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Drops every lock `owner` holds. Returns how many rows were released.
    pub fn release_owner(&self, owner: u64) -> usize {
        let released = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            let mut released = 0;
            held.retain(|_, lock| {
                let had_shared = lock.shared.remove(&owner);
                let had_exclusive = lock.exclusive == Some(owner);
                if had_exclusive {
                    lock.exclusive = None;
                }
                if had_shared || had_exclusive {
                    released += 1;
                }
                !lock.is_free()
            });
            released
        };
        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    pub fn is_locked(&self, key: &EntityKey) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.contains_key(key)
    }

    pub fn held_by(&self, owner: u64) -> usize {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.values()
            .filter(|lock| lock.exclusive == Some(owner) || lock.shared.contains(&owner))
            .count()
    }
}
